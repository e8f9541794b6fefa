//! Persisted user settings and API-key bootstrapping.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::{KeyValueStore, PersistedStore};

const API_KEY_KEY: &str = "api_key";
const SELECTED_MODEL_KEY: &str = "selectedModel";
const DEFAULT_ASSISTANT_ROLE_KEY: &str = "default_assistant_role";
const SHOW_TOKENS_KEY: &str = "show_tokens";

const DEFAULT_MODEL: &str = "gpt-4-1106-preview";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default system prompt applied to new conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantRole {
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for AssistantRole {
    fn default() -> Self {
        Self {
            role: "You are a helpful assistant.".to_string(),
            kind: "system".to_string(),
        }
    }
}

/// User settings, each cell persisted under its own key
pub struct Settings {
    pub api_key: PersistedStore<Option<String>>,
    pub selected_model: PersistedStore<String>,
    pub default_assistant_role: PersistedStore<AssistantRole>,
    pub show_tokens: PersistedStore<bool>,
}

impl Settings {
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            api_key: PersistedStore::load(backend.clone(), API_KEY_KEY, None),
            selected_model: PersistedStore::load(
                backend.clone(),
                SELECTED_MODEL_KEY,
                DEFAULT_MODEL.to_string(),
            ),
            default_assistant_role: PersistedStore::load(
                backend.clone(),
                DEFAULT_ASSISTANT_ROLE_KEY,
                AssistantRole::default(),
            ),
            show_tokens: PersistedStore::load(backend, SHOW_TOKENS_KEY, false),
        }
    }

    /// Resolve the API key: stored value first, then the environment.
    /// `None` means the caller should surface a reconfigure prompt rather
    /// than crash.
    pub fn bootstrap_api_key(&mut self) -> Option<String> {
        if let Some(key) = self.api_key.value() {
            info!("API key loaded from storage");
            return Some(key.clone());
        }

        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => {
                info!("API key loaded from environment");
                if let Err(err) = self.api_key.set(Some(key.clone())) {
                    warn!(error = %err, "Failed to persist API key from environment");
                }
                Some(key)
            }
            _ => {
                warn!("API key not found in storage or environment");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[test]
    fn test_defaults() {
        let settings = Settings::load(Arc::new(InMemoryStore::new()));
        assert_eq!(settings.api_key.value(), &None);
        assert_eq!(settings.selected_model.value(), DEFAULT_MODEL);
        assert!(!settings.show_tokens.value());
        assert_eq!(
            settings.default_assistant_role.value().role,
            "You are a helpful assistant."
        );
    }

    #[test]
    fn test_stored_api_key_wins_over_environment() {
        let backend = Arc::new(InMemoryStore::new());
        backend.set(API_KEY_KEY, "\"sk-stored\"").unwrap();

        let mut settings = Settings::load(backend);
        assert_eq!(settings.bootstrap_api_key(), Some("sk-stored".to_string()));
    }

    #[test]
    fn test_assistant_role_round_trip() {
        let backend = Arc::new(InMemoryStore::new());
        {
            let mut settings = Settings::load(backend.clone());
            settings
                .default_assistant_role
                .set(AssistantRole {
                    role: "You are terse.".to_string(),
                    kind: "system".to_string(),
                })
                .unwrap();
        }
        let settings = Settings::load(backend);
        assert_eq!(settings.default_assistant_role.value().role, "You are terse.");
    }
}
