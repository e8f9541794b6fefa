//! Application-facing facade: wires the conversation repository, the
//! stream coordinator, the completion client, and the token estimator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::models::conversation::{Conversation, ConversationId};
use crate::models::message::Message;
use crate::models::stream_coordinator::{
    CoordinatorError, StreamBuffer, StreamCoordinator, StreamOutcome,
};
use crate::models::stream_session::SessionError;
use crate::repositories::{ConversationRepository, RepositoryError};
use crate::services::completion::{
    CompletionClient, CompletionMessage, CompletionRequest, StreamChunk,
};
use crate::services::openai_client::OpenAiClient;
use crate::services::token_estimator::{TiktokenEstimator, TokenEstimator};
use crate::settings::Settings;
use crate::storage::{KeyValueStore, StorageError};

const EVENT_BUFFER: usize = 64;
const TITLE_MAX_CHARS: usize = 48;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a stream is already active for conversation {id}")]
    AlreadyStreaming { id: String },

    #[error("API key is not configured")]
    MissingApiKey,

    #[error("engine initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<CoordinatorError> for EngineError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::AlreadyStreaming { id } => Self::AlreadyStreaming { id },
            CoordinatorError::Session(err) => Self::Session(err),
        }
    }
}

/// Events emitted for decoupled UI updates.
/// Each variant is tagged with `conversation_id` so subscribers can filter.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StreamStarted {
        conversation_id: ConversationId,
    },
    TextDelta {
        conversation_id: ConversationId,
        text: String,
    },
    StreamEnded {
        conversation_id: ConversationId,
        outcome: StreamOutcome,
    },
    ConversationsChanged,
}

struct EngineState {
    repository: ConversationRepository,
    coordinator: StreamCoordinator,
    settings: Settings,
}

/// The chat engine.
///
/// All state transitions happen under one lock, driven by discrete events
/// (user commands, transport chunks); the lock is never held across an
/// await. `begin_stream` returns immediately after registering the session;
/// progress is observed through the stream buffer and the event channel.
#[derive(Clone)]
pub struct ChatEngine {
    state: Arc<Mutex<EngineState>>,
    client: Arc<dyn CompletionClient>,
    estimator: Arc<dyn TokenEstimator>,
    events: broadcast::Sender<EngineEvent>,
}

impl ChatEngine {
    /// Build an engine over explicit collaborators
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        client: Arc<dyn CompletionClient>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let settings = Settings::load(backend.clone());
        Self::with_parts(backend, settings, client, estimator)
    }

    /// Build a production engine from durable storage: resolves the API key
    /// (stored value, then environment; absent surfaces `MissingApiKey` as
    /// a reconfigure prompt, not a crash) and wires the default client and
    /// estimator.
    pub fn bootstrap(backend: Arc<dyn KeyValueStore>) -> Result<Self, EngineError> {
        let mut settings = Settings::load(backend.clone());
        let api_key = settings
            .bootstrap_api_key()
            .ok_or(EngineError::MissingApiKey)?;
        let client = Arc::new(OpenAiClient::new(api_key));
        let estimator = Arc::new(
            TiktokenEstimator::new().map_err(|err| EngineError::Init(err.to_string()))?,
        );
        Ok(Self::with_parts(backend, settings, client, estimator))
    }

    fn with_parts(
        backend: Arc<dyn KeyValueStore>,
        settings: Settings,
        client: Arc<dyn CompletionClient>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let repository =
            ConversationRepository::load(backend, &settings.default_assistant_role.value().role);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            state: Arc::new(Mutex::new(EngineState {
                repository,
                coordinator: StreamCoordinator::new(),
                settings,
            })),
            client,
            estimator,
            events,
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ----- conversation commands -----

    pub fn create_conversation(&self) -> ConversationId {
        let id = {
            let mut state = self.state.lock();
            let role = state.settings.default_assistant_role.value().role.clone();
            state.repository.create_conversation(Some(&role))
        };
        let _ = self.events.send(EngineEvent::ConversationsChanged);
        id
    }

    pub fn select_conversation(&self, id: &str) -> Result<(), EngineError> {
        self.state.lock().repository.select_conversation(id)?;
        let _ = self.events.send(EngineEvent::ConversationsChanged);
        Ok(())
    }

    pub fn rename_conversation(&self, id: &str, title: &str) -> Result<(), EngineError> {
        self.state.lock().repository.rename_conversation(id, title)?;
        let _ = self.events.send(EngineEvent::ConversationsChanged);
        Ok(())
    }

    /// Delete a conversation. An active stream for it is discarded without
    /// commit: its buffer dies with the conversation.
    pub fn delete_conversation(&self, id: &str) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.coordinator.discard(id) {
                debug!(conv_id = %id, "Discarded active stream for deleted conversation");
            }
            state.repository.delete_conversation(id)?;
        }
        let _ = self.events.send(EngineEvent::ConversationsChanged);
        Ok(())
    }

    /// Append a user message with an estimator-derived token delta. A blank
    /// conversation title is auto-assigned from the first user message.
    pub fn append_user_message(
        &self,
        id: &str,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<(), EngineError> {
        let token_delta = self.estimator.estimate(text) as i64;
        {
            let mut state = self.state.lock();
            state
                .repository
                .append_message(id, Message::user(text, attachments), token_delta)?;
            if state.repository.get(id).is_some_and(|c| c.title().is_empty()) {
                let title = auto_title(text);
                state.repository.rename_conversation(id, &title)?;
            }
        }
        let _ = self.events.send(EngineEvent::ConversationsChanged);
        Ok(())
    }

    /// Append a user message to the chosen conversation and start streaming
    /// the assistant's reply. Returns the target conversation id.
    pub fn send_user_message(
        &self,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<ConversationId, EngineError> {
        let id = self.state.lock().repository.chosen().id().to_string();
        self.append_user_message(&id, text, attachments)?;
        self.begin_stream(&id)?;
        Ok(id)
    }

    // ----- streaming -----

    /// Start a streaming completion for a conversation. Fails with
    /// `AlreadyStreaming` while a session for that id is live. Returns as
    /// soon as the session is registered; the transport runs on a spawned
    /// task and terminal outcomes are committed there.
    pub fn begin_stream(&self, conversation_id: &str) -> Result<(), EngineError> {
        let (request, cancel_flag) = {
            let mut state = self.state.lock();
            let conversation = state.repository.get(conversation_id).ok_or_else(|| {
                RepositoryError::NotFound {
                    id: conversation_id.to_string(),
                }
            })?;

            let mut messages = vec![CompletionMessage {
                role: "system".to_string(),
                content: conversation.assistant_role().to_string(),
            }];
            messages.extend(conversation.history().iter().map(CompletionMessage::from));

            let request = CompletionRequest {
                model: state.settings.selected_model.get(),
                messages,
            };
            let cancel_flag = state.coordinator.begin(conversation_id)?;
            (request, cancel_flag)
        };

        let _ = self.events.send(EngineEvent::StreamStarted {
            conversation_id: conversation_id.to_string(),
        });

        let engine = self.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            engine.run_stream(id, request, cancel_flag).await;
        });

        Ok(())
    }

    /// Cooperatively cancel a conversation's stream, committing the partial
    /// text immediately. No live stream is a no-op; a new `begin_stream`
    /// for the same conversation succeeds right away.
    pub fn cancel_stream(&self, conversation_id: &str) {
        let partial = self.state.lock().coordinator.cancel(conversation_id);
        if let Some(text) = partial {
            self.commit(conversation_id, StreamOutcome::Cancelled, text);
        }
    }

    /// Cancel every active stream, committing partial texts (app shutdown)
    pub fn cancel_all_streams(&self) {
        let cancelled = self.state.lock().coordinator.cancel_all();
        for (id, text) in cancelled {
            self.commit(&id, StreamOutcome::Cancelled, text);
        }
    }

    async fn run_stream(
        self,
        conversation_id: String,
        request: CompletionRequest,
        cancel_flag: Arc<AtomicBool>,
    ) {
        let mut stream = match self.client.stream_completion(request).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(conv_id = %conversation_id, error = %err, "Failed to open completion stream");
                self.resolve_terminal(
                    &conversation_id,
                    StreamChunk::Error(err.to_string()),
                    &cancel_flag,
                );
                return;
            }
        };

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => StreamChunk::Error(err.to_string()),
            };

            match chunk {
                StreamChunk::Text(text) => {
                    // The flag is raised inside the coordinator under this
                    // lock, so checking it here excludes the interleaving
                    // where a cancel plus an immediate restart registered a
                    // replacement session between a bare flag load and the
                    // route. An orphaned task must never reach the
                    // replacement.
                    let routed = {
                        let mut state = self.state.lock();
                        if cancel_flag.load(Ordering::Relaxed) {
                            debug!(conv_id = %conversation_id, "Cancel flag observed, closing transport");
                            return;
                        }
                        state.coordinator.push_delta(&conversation_id, &text)
                    };
                    if !routed {
                        debug!(conv_id = %conversation_id, "Session gone, abandoning stream");
                        return;
                    }
                    let _ = self.events.send(EngineEvent::TextDelta {
                        conversation_id: conversation_id.clone(),
                        text,
                    });
                }
                terminal => {
                    self.resolve_terminal(&conversation_id, terminal, &cancel_flag);
                    return;
                }
            }
        }

        // Transport dropped without an explicit end-of-stream marker
        self.resolve_terminal(
            &conversation_id,
            StreamChunk::Error("stream ended unexpectedly".to_string()),
            &cancel_flag,
        );
    }

    /// Resolve a terminal chunk against the owning session. The flag check
    /// happens under the state lock for the same reason as in the delta
    /// path: a cancelled task's terminal chunk must not resolve a
    /// replacement session started for the same conversation.
    fn resolve_terminal(
        &self,
        conversation_id: &str,
        chunk: StreamChunk,
        cancel_flag: &AtomicBool,
    ) {
        let resolved = {
            let mut state = self.state.lock();
            if cancel_flag.load(Ordering::Relaxed) {
                debug!(conv_id = %conversation_id, "Cancel flag observed, dropping terminal chunk");
                return;
            }
            state.coordinator.handle_chunk(conversation_id, chunk)
        };
        if let Some((outcome, text)) = resolved {
            self.commit(conversation_id, outcome, text);
        }
    }

    /// Commit accumulated stream text as an assistant message. Partial text
    /// from failed or cancelled streams is committed too, so generated work
    /// is never silently discarded.
    fn commit(&self, conversation_id: &str, outcome: StreamOutcome, text: String) {
        if !text.is_empty() || matches!(outcome, StreamOutcome::Completed) {
            let token_delta = self.estimator.estimate(&text) as i64;
            let result = self.state.lock().repository.append_message(
                conversation_id,
                Message::assistant(text),
                token_delta,
            );
            match result {
                Ok(()) => {
                    debug!(conv_id = %conversation_id, outcome = ?outcome, "Assistant message committed")
                }
                Err(RepositoryError::NotFound { .. }) => {
                    warn!(conv_id = %conversation_id, "Conversation deleted mid-stream, dropping response")
                }
                Err(err) => {
                    error!(conv_id = %conversation_id, error = %err, "Failed to persist assistant message")
                }
            }
        }

        let _ = self.events.send(EngineEvent::StreamEnded {
            conversation_id: conversation_id.to_string(),
            outcome,
        });
        let _ = self.events.send(EngineEvent::ConversationsChanged);
    }

    // ----- observable state -----

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().repository.conversations().to_vec()
    }

    pub fn chosen_index(&self) -> usize {
        self.state.lock().repository.chosen_index()
    }

    pub fn chosen_conversation(&self) -> Conversation {
        self.state.lock().repository.chosen().clone()
    }

    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.state.lock().repository.get(id).cloned()
    }

    pub fn combined_tokens(&self) -> u64 {
        self.state.lock().repository.combined_tokens()
    }

    /// Snapshot of the in-flight stream buffer for a conversation
    pub fn stream_buffer(&self, conversation_id: &str) -> Option<StreamBuffer> {
        self.state.lock().coordinator.buffer(conversation_id)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.state.lock().coordinator.is_streaming(conversation_id)
    }

    // ----- settings -----

    pub fn selected_model(&self) -> String {
        self.state.lock().settings.selected_model.get()
    }

    pub fn set_selected_model(&self, model: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .settings
            .selected_model
            .set(model.to_string())?;
        Ok(())
    }

    pub fn show_tokens(&self) -> bool {
        *self.state.lock().settings.show_tokens.value()
    }

    pub fn set_show_tokens(&self, show: bool) -> Result<(), EngineError> {
        self.state.lock().settings.show_tokens.set(show)?;
        Ok(())
    }

    pub fn set_api_key(&self, key: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .settings
            .api_key
            .set(Some(key.to_string()))?;
        Ok(())
    }
}

/// Derive a display title from the first user message
fn auto_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}
