pub mod conversation_repository;
pub mod error;

pub use conversation_repository::ConversationRepository;
pub use error::{RepositoryError, RepositoryResult};
