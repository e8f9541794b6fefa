use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::models::message::{Message, Role};

/// Stream chunks emitted during responses
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done,
    Error(String),
}

/// Type alias for response streams
pub type ResponseStream = BoxStream<'static, Result<StreamChunk>>;

/// One {role, content} entry in a completion request payload
#[derive(Debug, Clone, Serialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for CompletionMessage {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

/// A completion request: the full ordered message history plus model choice
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<CompletionMessage>,
}

/// The opaque completion-service seam: initiating a request produces a
/// lazy, finite, non-restartable sequence of chunks ending in `Done` or
/// `Error`.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<ResponseStream>;
}
