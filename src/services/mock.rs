//! Scripted completion clients for tests and development.

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::completion::{CompletionClient, CompletionRequest, ResponseStream, StreamChunk};

/// Completion client that replays pre-scripted chunk sequences, one script
/// per call, and records the requests it received.
#[derive(Default)]
pub struct MockCompletionClient {
    scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(chunks: Vec<StreamChunk>) -> Self {
        let client = Self::new();
        client.push_script(chunks);
        client
    }

    pub fn push_script(&self, chunks: Vec<StreamChunk>) {
        self.scripts.lock().push_back(chunks);
    }

    /// Requests seen so far, in call order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<ResponseStream> {
        self.requests.lock().push(request);
        let chunks = self.scripts.lock().pop_front().unwrap_or_default();
        let stream: ResponseStream = Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
        Ok(stream)
    }
}

/// Completion client whose streams are fed by channels, each staying open
/// until its sender delivers a terminal chunk or drops. Lets tests hold a
/// stream open (cancellation, concurrent-begin checks) and drive deltas one
/// at a time; `push_channel` queues a channel for the next call.
pub struct ChannelCompletionClient {
    receivers: Mutex<VecDeque<mpsc::UnboundedReceiver<StreamChunk>>>,
}

impl ChannelCompletionClient {
    pub fn new() -> (mpsc::UnboundedSender<StreamChunk>, Self) {
        let client = Self {
            receivers: Mutex::new(VecDeque::new()),
        };
        let tx = client.push_channel();
        (tx, client)
    }

    /// Queue a fresh channel; calls consume queued channels in order
    pub fn push_channel(&self) -> mpsc::UnboundedSender<StreamChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.receivers.lock().push_back(rx);
        tx
    }
}

#[async_trait]
impl CompletionClient for ChannelCompletionClient {
    async fn stream_completion(&self, _request: CompletionRequest) -> Result<ResponseStream> {
        let mut receiver = self
            .receivers
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted channel queued"))?;

        let stream: ResponseStream = Box::pin(async_stream::stream! {
            while let Some(chunk) = receiver.recv().await {
                let terminal = !matches!(chunk, StreamChunk::Text(_));
                yield Ok(chunk);
                if terminal {
                    return;
                }
            }
        });
        Ok(stream)
    }
}
