use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

use super::conversation::ConversationId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid stream session state: expected {expected}, session was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Lifecycle state of one in-flight streaming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Streaming => "Streaming",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// State machine for a single streaming request.
///
/// `Idle → Connecting → Streaming → {Completed, Failed, Cancelled}`.
/// Terminal states are absorbing. Text accumulates in arrival order; the
/// transport guarantees ordered delivery and nothing here reorders it.
///
/// Cancellation is cooperative: `request_cancel()` only raises the shared
/// flag (the transport task closes the connection when it observes it);
/// the owner then resolves the session with `mark_cancelled()`.
pub struct StreamSession {
    conversation_id: ConversationId,
    state: SessionState,
    accumulated: String,
    failure: Option<String>,
    cancel_flag: Arc<AtomicBool>,
}

impl StreamSession {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            state: SessionState::Idle,
            accumulated: String::new(),
            failure: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Shared cancellation flag handed to the transport task
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// `Idle → Connecting`. Starting a terminated (or already started)
    /// session is a contract violation.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Connecting;
                Ok(())
            }
            _ => Err(self.invalid_state("Idle")),
        }
    }

    /// Append one delta fragment. The first delta moves the session from
    /// `Connecting` to `Streaming`. Deltas arriving after a cancel request
    /// are dropped: the text returned to the caller is what had accumulated
    /// up to the cancellation point.
    pub fn push_delta(&mut self, text: &str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Streaming => {
                if self.cancel_requested() {
                    debug!(conv_id = %self.conversation_id, "Dropping delta after cancel request");
                    return Ok(());
                }
                self.state = SessionState::Streaming;
                self.accumulated.push_str(text);
                Ok(())
            }
            _ => Err(self.invalid_state("Connecting or Streaming")),
        }
    }

    /// End-of-stream signal from the transport; yields the full text.
    pub fn complete(&mut self) -> Result<String, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Streaming => {
                self.state = SessionState::Completed;
                Ok(std::mem::take(&mut self.accumulated))
            }
            _ => Err(self.invalid_state("Connecting or Streaming")),
        }
    }

    /// Transport error or malformed payload; yields the partial text so it
    /// is not silently lost.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<String, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Streaming => {
                self.state = SessionState::Failed;
                self.failure = Some(reason.into());
                Ok(std::mem::take(&mut self.accumulated))
            }
            _ => Err(self.invalid_state("Connecting or Streaming")),
        }
    }

    /// Raise the cancel flag. The transport observes it cooperatively.
    pub fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    /// Resolve the session as cancelled; yields the partial text.
    pub fn mark_cancelled(&mut self) -> Result<String, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Streaming => {
                self.state = SessionState::Cancelled;
                Ok(std::mem::take(&mut self.accumulated))
            }
            _ => Err(self.invalid_state("Connecting or Streaming")),
        }
    }

    fn invalid_state(&self, expected: &'static str) -> SessionError {
        SessionError::InvalidState {
            expected,
            actual: self.state.name(),
        }
    }
}
