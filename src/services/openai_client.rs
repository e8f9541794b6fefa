use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::completion::{CompletionClient, CompletionMessage, CompletionRequest, ResponseStream, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat-completions request body
#[derive(Debug, Serialize)]
struct ChatCompletionsBody {
    model: String,
    stream: bool,
    messages: Vec<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// API error response
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Decode one SSE line from the completion endpoint.
///
/// Returns `None` for lines that carry no chunk (blank lines, comments,
/// `event:` fields, empty deltas). A malformed `data:` payload yields
/// `StreamChunk::Error` so the session fails rather than silently skipping.
fn parse_data_line(line: &str) -> Option<StreamChunk> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(StreamChunk::Done);
    }
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(parsed) => parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|text| !text.is_empty())
            .map(StreamChunk::Text),
        Err(err) => Some(StreamChunk::Error(format!(
            "malformed stream payload: {}",
            err
        ))),
    }
}

/// Split completed newline-terminated lines out of the transport buffer.
///
/// Transport chunks split at arbitrary byte offsets, including mid-way
/// through a UTF-8 sequence; bytes after the last newline stay buffered so
/// decoding only ever sees whole lines.
fn drain_complete_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Streaming chat-completions client over SSE
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint (proxy, compatible server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionsBody {
            model: request.model.clone(),
            stream: true,
            messages: request.messages,
        };

        debug!(model = %request.model, "Opening completion stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ErrorResponse>(&raw) {
                Ok(parsed) => format!("{} ({})", parsed.error.message, parsed.error.error_type),
                Err(_) => raw,
            };
            anyhow::bail!("completion service returned {}: {}", status, detail);
        }

        let mut bytes = response.bytes_stream();
        let stream: ResponseStream = Box::pin(async_stream::stream! {
            let mut pending: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Ok(StreamChunk::Error(format!("transport error: {}", err)));
                        return;
                    }
                };
                pending.extend_from_slice(&chunk);

                for line in drain_complete_lines(&mut pending) {
                    if let Some(parsed) = parse_data_line(&line) {
                        let terminal = !matches!(parsed, StreamChunk::Text(_));
                        yield Ok(parsed);
                        if terminal {
                            return;
                        }
                    }
                }
            }
            // Connection closed without an explicit end-of-stream marker
            yield Ok(StreamChunk::Error("stream closed before completion".to_string()));
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match parse_data_line(line) {
            Some(StreamChunk::Text(text)) => assert_eq!(text, "Hel"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_done_sentinel() {
        assert!(matches!(
            parse_data_line("data: [DONE]"),
            Some(StreamChunk::Done)
        ));
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        assert!(parse_data_line("").is_none());
        assert!(parse_data_line(": keep-alive").is_none());
        assert!(parse_data_line("event: message").is_none());
    }

    #[test]
    fn test_empty_delta_is_skipped() {
        // role-only first frame carries no content
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_data_line(line).is_none());
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        // Bisect the two-byte encoding of 'é'
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut pending = Vec::new();
        pending.extend_from_slice(&frame[..split]);
        assert!(drain_complete_lines(&mut pending).is_empty());

        pending.extend_from_slice(&frame[split..]);
        let lines = drain_complete_lines(&mut pending);
        assert_eq!(lines.len(), 1);
        match parse_data_line(&lines[0]) {
            Some(StreamChunk::Text(text)) => assert_eq!(text, "café"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let mut pending = b"data: [DO".to_vec();
        assert!(drain_complete_lines(&mut pending).is_empty());

        pending.extend_from_slice(b"NE]\r\ndata: tail");
        assert_eq!(drain_complete_lines(&mut pending), vec!["data: [DONE]"]);
        assert_eq!(pending, b"data: tail");
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut pending = b"first\nsecond\r\nthird\n".to_vec();
        assert_eq!(
            drain_complete_lines(&mut pending),
            vec!["first", "second", "third"]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(matches!(
            parse_data_line("data: {not json"),
            Some(StreamChunk::Error(_))
        ));
    }
}
