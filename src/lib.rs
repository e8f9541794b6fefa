//! quillchat — streaming chat engine.
//!
//! Maintains an ordered collection of persisted conversation threads with
//! token accounting, and assembles streamed completion responses into the
//! owning conversation's buffer with cooperative cancellation. UI layers
//! subscribe to [`EngineEvent`]s and issue commands on [`ChatEngine`].

pub mod engine;
pub mod logging;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;
pub mod storage;

pub use engine::{ChatEngine, EngineError, EngineEvent};
pub use models::conversation::{Conversation, ConversationId};
pub use models::message::{Message, Role};
pub use models::stream_coordinator::{StreamBuffer, StreamCoordinator, StreamOutcome};
pub use models::stream_session::{SessionState, StreamSession};
pub use repositories::{ConversationRepository, RepositoryError};
pub use services::completion::{CompletionClient, CompletionRequest, StreamChunk};
pub use services::openai_client::OpenAiClient;
pub use services::token_estimator::{TiktokenEstimator, TokenEstimator};
pub use settings::Settings;
pub use storage::{InMemoryStore, JsonFileStore, KeyValueStore, PersistedStore};
