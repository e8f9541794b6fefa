use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;
use tracing::{debug, warn};

use super::conversation::ConversationId;
use super::stream_session::{SessionError, StreamSession};
use crate::services::completion::StreamChunk;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a stream is already active for conversation {id}")]
    AlreadyStreaming { id: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// How a stream ended. `Failed` and `Cancelled` still carry whatever text
/// accumulated, handed back alongside this outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// UI-observable snapshot of an in-flight accumulation
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub conversation_id: ConversationId,
    pub text: String,
}

/// Enforces the single-active-stream-per-conversation rule and routes
/// incoming chunks to the owning conversation's session.
///
/// Sessions are removed on any terminal outcome, unblocking future `begin`
/// calls for that conversation. Chunks addressed to an unknown conversation
/// (orphaned transport tasks, deleted conversations) are ignored.
pub struct StreamCoordinator {
    sessions: HashMap<ConversationId, StreamSession>,
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a started session for a conversation. Fails if one is
    /// already live for that id; the existing session and its buffer are
    /// untouched.
    pub fn begin(&mut self, conversation_id: &str) -> Result<Arc<AtomicBool>, CoordinatorError> {
        if self.sessions.contains_key(conversation_id) {
            return Err(CoordinatorError::AlreadyStreaming {
                id: conversation_id.to_string(),
            });
        }

        let mut session = StreamSession::new(conversation_id.to_string());
        session.start()?;
        let cancel_flag = session.cancel_flag();
        self.sessions.insert(conversation_id.to_string(), session);

        debug!(conv_id = %conversation_id, "Stream session registered");
        Ok(cancel_flag)
    }

    /// Append a delta to the owning conversation's buffer.
    /// Returns false when no session exists for the id.
    pub fn push_delta(&mut self, conversation_id: &str, text: &str) -> bool {
        match self.sessions.get_mut(conversation_id) {
            Some(session) => {
                // Live sessions are never terminal, so this cannot fail
                if let Err(err) = session.push_delta(text) {
                    warn!(conv_id = %conversation_id, error = %err, "Dropped delta");
                }
                true
            }
            None => false,
        }
    }

    /// Resolve a session as completed; yields the full text for commit.
    pub fn complete(&mut self, conversation_id: &str) -> Option<String> {
        self.resolve(conversation_id, |session| session.complete())
    }

    /// Resolve a session as failed; yields the partial text for commit.
    pub fn fail(&mut self, conversation_id: &str, reason: &str) -> Option<String> {
        self.resolve(conversation_id, |session| session.fail(reason))
    }

    /// Signal cancellation and resolve the session; yields the partial text
    /// for commit. No live session is a no-op, not an error.
    pub fn cancel(&mut self, conversation_id: &str) -> Option<String> {
        let mut session = self.sessions.remove(conversation_id)?;
        session.request_cancel();
        match session.mark_cancelled() {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(conv_id = %conversation_id, error = %err, "Cancel on resolved session");
                None
            }
        }
    }

    /// Route a transport chunk. Terminal chunks hand back `(outcome, text)`
    /// for the caller to commit; text chunks return `None` after appending.
    pub fn handle_chunk(
        &mut self,
        conversation_id: &str,
        chunk: StreamChunk,
    ) -> Option<(StreamOutcome, String)> {
        match chunk {
            StreamChunk::Text(text) => {
                self.push_delta(conversation_id, &text);
                None
            }
            StreamChunk::Done => self
                .complete(conversation_id)
                .map(|text| (StreamOutcome::Completed, text)),
            StreamChunk::Error(reason) => self
                .fail(conversation_id, &reason)
                .map(|text| (StreamOutcome::Failed(reason), text)),
        }
    }

    /// Drop a session and its buffer without commit (owning conversation
    /// deleted mid-stream). The cancel flag is raised so the transport task
    /// shuts down.
    pub fn discard(&mut self, conversation_id: &str) -> bool {
        match self.sessions.remove(conversation_id) {
            Some(session) => {
                session.request_cancel();
                debug!(conv_id = %conversation_id, "Stream session discarded");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the in-flight buffer for a conversation
    pub fn buffer(&self, conversation_id: &str) -> Option<StreamBuffer> {
        self.sessions.get(conversation_id).map(|session| StreamBuffer {
            conversation_id: conversation_id.to_string(),
            text: session.text().to_string(),
        })
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.sessions.contains_key(conversation_id)
    }

    pub fn has_active_streams(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// Cancel every active stream (app shutdown); yields partial texts.
    pub fn cancel_all(&mut self) -> Vec<(ConversationId, String)> {
        let ids: Vec<ConversationId> = self.sessions.keys().cloned().collect();
        ids.into_iter()
            .filter_map(|id| self.cancel(&id).map(|text| (id, text)))
            .collect()
    }

    fn resolve<F>(&mut self, conversation_id: &str, f: F) -> Option<String>
    where
        F: FnOnce(&mut StreamSession) -> Result<String, SessionError>,
    {
        let mut session = self.sessions.remove(conversation_id)?;
        match f(&mut session) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(conv_id = %conversation_id, error = %err, "Resolve on terminated session");
                None
            }
        }
    }
}

impl Default for StreamCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
