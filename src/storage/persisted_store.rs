use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::error::StorageResult;
use super::key_value::KeyValueStore;

type Subscriber<T> = Box<dyn Fn(&T) + Send>;

/// A typed value cell backed by a key in durable storage.
///
/// Loads its initial value at construction (falling back to a default when
/// the key is absent or unparseable) and writes every change back through
/// the backend before notifying subscribers. There is no batching: each
/// `set`/`update` persists immediately.
pub struct PersistedStore<T> {
    backend: Arc<dyn KeyValueStore>,
    key: String,
    value: T,
    subscribers: Vec<Subscriber<T>>,
}

impl<T> PersistedStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Load the stored value for `key`, or fall back to `default`.
    ///
    /// Parse and read failures are not fatal: the default is used and the
    /// failure is logged.
    pub fn load(backend: Arc<dyn KeyValueStore>, key: &str, default: T) -> Self {
        let value = match backend.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!(key, error = %err, "Stored value unparseable, falling back to default");
                    default
                }
            },
            Ok(None) => default,
            Err(err) => {
                warn!(key, error = %err, "Failed to read stored value, falling back to default");
                default
            }
        };

        Self {
            backend,
            key: key.to_string(),
            value,
            subscribers: Vec::new(),
        }
    }

    /// Borrow the current value
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Clone the current value
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.clone()
    }

    /// Replace the value, persisting it before returning.
    ///
    /// On a write failure the in-memory value stays updated (it remains the
    /// source of truth for the current session) and the error is surfaced;
    /// the previously persisted bytes are left intact.
    pub fn set(&mut self, value: T) -> StorageResult<()> {
        self.value = value;
        self.persist_and_notify()
    }

    /// Mutate the value in place, persisting it before returning
    pub fn update<F>(&mut self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut T),
    {
        f(&mut self.value);
        self.persist_and_notify()
    }

    /// Register an observer invoked synchronously after every successful
    /// write, in subscription order.
    pub fn subscribe<F>(&mut self, f: F)
    where
        F: Fn(&T) + Send + 'static,
    {
        self.subscribers.push(Box::new(f));
    }

    fn persist_and_notify(&self) -> StorageResult<()> {
        let raw = serde_json::to_string(&self.value)?;
        self.backend.set(&self.key, &raw)?;
        for subscriber in &self.subscribers {
            subscriber(&self.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::key_value::InMemoryStore;

    #[test]
    fn test_default_when_absent() {
        let backend = Arc::new(InMemoryStore::new());
        let store: PersistedStore<u64> = PersistedStore::load(backend, "tokens", 42);
        assert_eq!(*store.value(), 42);
    }

    #[test]
    fn test_default_when_unparseable() {
        let backend = Arc::new(InMemoryStore::new());
        backend.set("tokens", "not json at all").unwrap();

        let store: PersistedStore<u64> = PersistedStore::load(backend, "tokens", 7);
        assert_eq!(*store.value(), 7);
    }

    #[test]
    fn test_set_persists_immediately() {
        let backend = Arc::new(InMemoryStore::new());
        let mut store: PersistedStore<Vec<String>> =
            PersistedStore::load(backend.clone(), "names", Vec::new());

        store.set(vec!["ada".to_string()]).unwrap();
        assert_eq!(backend.get("names").unwrap(), Some("[\"ada\"]".to_string()));

        // A fresh cell over the same backend sees the written value
        let reloaded: PersistedStore<Vec<String>> =
            PersistedStore::load(backend, "names", Vec::new());
        assert_eq!(reloaded.value(), &["ada".to_string()]);
    }

    #[test]
    fn test_update_in_place() {
        let backend = Arc::new(InMemoryStore::new());
        let mut store: PersistedStore<u64> = PersistedStore::load(backend.clone(), "count", 0);

        store.update(|v| *v += 5).unwrap();
        store.update(|v| *v += 3).unwrap();

        assert_eq!(*store.value(), 8);
        assert_eq!(backend.get("count").unwrap(), Some("8".to_string()));
    }

    #[test]
    fn test_subscribers_run_in_order_after_set() {
        let backend = Arc::new(InMemoryStore::new());
        let mut store: PersistedStore<u64> = PersistedStore::load(backend, "count", 0);

        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        store.subscribe(move |value| {
            // First subscriber sees an even call counter
            assert_eq!(first.fetch_add(1, Ordering::SeqCst) % 2, 0);
            assert_eq!(*value, 9);
        });
        let second = calls.clone();
        store.subscribe(move |_| {
            assert_eq!(second.fetch_add(1, Ordering::SeqCst) % 2, 1);
        });

        store.set(9).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
