use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use super::error::{StorageError, StorageResult};

/// Durable key-value storage backing the persisted stores.
///
/// Every `set` fully overwrites its key; there is no partial-write state
/// observable through this trait.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// File-backed store: one JSON file per key under the app config directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store with an XDG-compliant path
    pub fn new() -> StorageResult<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| StorageError::Initialization {
                message: "Could not determine config directory".to_string(),
            })?
            .join("quillchat")
            .join("state");

        Ok(Self { dir })
    }

    /// Create a store rooted at a custom directory (for testing)
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&path)?))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        // Write atomically (write to temp, then rename) so a failed write
        // leaves the previously stored value intact.
        let path = self.key_path(key);
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, value)?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and development
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::with_dir(tmp.path().to_path_buf());

        store.set("greeting", "\"hello\"").unwrap();
        assert_eq!(store.get("greeting").unwrap(), Some("\"hello\"".to_string()));
    }

    #[test]
    fn test_file_store_absent_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::with_dir(tmp.path().to_path_buf());

        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_file_store_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::with_dir(tmp.path().to_path_buf());

        store.set("value", "1").unwrap();
        store.set("value", "2").unwrap();
        assert_eq!(store.get("value").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_file_store_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::with_dir(tmp.path().to_path_buf());

        store.set("value", "1").unwrap();
        store.remove("value").unwrap();
        assert_eq!(store.get("value").unwrap(), None);

        // Removing an absent key is not an error
        store.remove("value").unwrap();
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
