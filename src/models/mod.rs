pub mod conversation;
pub mod message;
pub mod stream_coordinator;
pub mod stream_session;

pub use conversation::{Conversation, ConversationId};
pub use message::{Message, Role};
pub use stream_coordinator::{CoordinatorError, StreamBuffer, StreamCoordinator, StreamOutcome};
pub use stream_session::{SessionError, SessionState, StreamSession};
