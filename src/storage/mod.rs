pub mod error;
pub mod key_value;
pub mod persisted_store;

pub use error::{StorageError, StorageResult};
pub use key_value::{InMemoryStore, JsonFileStore, KeyValueStore};
pub use persisted_store::PersistedStore;
