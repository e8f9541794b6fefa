use std::sync::Arc;

use tracing::{debug, error};

use super::error::{RepositoryError, RepositoryResult};
use crate::models::conversation::{Conversation, ConversationId};
use crate::models::message::Message;
use crate::storage::{KeyValueStore, PersistedStore};

const CONVERSATIONS_KEY: &str = "conversations";
const CHOSEN_KEY: &str = "chosen_conversation";
const COMBINED_TOKENS_KEY: &str = "combined_tokens";

/// Owns the ordered conversation list, the chosen index, and the all-time
/// combined token total, each persisted under its own storage key.
///
/// Invariants: the list is never empty after construction; the chosen index
/// always resolves to an existing conversation; every mutating operation
/// persists before returning. A storage write failure surfaces as an error
/// but does not roll back in-memory state — the in-memory sequence remains
/// the source of truth for the current session.
pub struct ConversationRepository {
    conversations: PersistedStore<Vec<Conversation>>,
    chosen: PersistedStore<usize>,
    combined_tokens: PersistedStore<u64>,
    default_assistant_role: String,
}

impl ConversationRepository {
    /// Load persisted state, creating a default conversation when none
    /// exists. The chosen index is reset to the last conversation on load.
    pub fn load(backend: Arc<dyn KeyValueStore>, default_assistant_role: &str) -> Self {
        let mut conversations =
            PersistedStore::load(backend.clone(), CONVERSATIONS_KEY, Vec::new());
        let mut chosen = PersistedStore::load(backend.clone(), CHOSEN_KEY, 0usize);
        let combined_tokens = PersistedStore::load(backend, COMBINED_TOKENS_KEY, 0u64);

        if conversations.value().is_empty() {
            let default = Conversation::new(default_assistant_role);
            debug!(conv_id = %default.id(), "No persisted conversations, creating default");
            if let Err(err) = conversations.set(vec![default]) {
                error!(error = %err, "Failed to persist default conversation");
            }
        }

        // Most recent conversation becomes chosen on startup
        let last = conversations.value().len() - 1;
        if *chosen.value() != last
            && let Err(err) = chosen.set(last)
        {
            error!(error = %err, "Failed to persist chosen index");
        }

        Self {
            conversations,
            chosen,
            combined_tokens,
            default_assistant_role: default_assistant_role.to_string(),
        }
    }

    /// Append a new empty conversation and choose it. Never fails: a
    /// storage write failure is logged, in-memory state holds.
    pub fn create_conversation(&mut self, assistant_role: Option<&str>) -> ConversationId {
        let role = assistant_role.unwrap_or(&self.default_assistant_role);
        let conversation = Conversation::new(role);
        let id = conversation.id().to_string();

        if let Err(err) = self.conversations.update(|list| list.push(conversation)) {
            error!(conv_id = %id, error = %err, "Failed to persist new conversation");
        }
        let last = self.conversations.value().len() - 1;
        if let Err(err) = self.chosen.set(last) {
            error!(error = %err, "Failed to persist chosen index");
        }

        debug!(conv_id = %id, index = last, "Conversation created");
        id
    }

    /// Set the chosen index to the conversation with `id`
    pub fn select_conversation(&mut self, id: &str) -> RepositoryResult<()> {
        let index = self.index_of(id)?;
        self.chosen.set(index)?;
        Ok(())
    }

    /// Append a message and adjust the token count by `token_delta`
    /// (negative deltas are corrective and clamp at zero). Positive deltas
    /// also feed the all-time combined total.
    pub fn append_message(
        &mut self,
        id: &str,
        message: Message,
        token_delta: i64,
    ) -> RepositoryResult<()> {
        let index = self.index_of(id)?;
        self.conversations.update(|list| {
            list[index].push_message(message);
            list[index].add_tokens(token_delta);
        })?;
        if token_delta > 0 {
            self.combined_tokens.update(|total| *total += token_delta as u64)?;
        }
        Ok(())
    }

    /// Remove a conversation. The chosen index moves to the nearest
    /// preceding conversation; deleting the last remaining conversation
    /// replaces it with a fresh default.
    pub fn delete_conversation(&mut self, id: &str) -> RepositoryResult<()> {
        let index = self.index_of(id)?;
        let current = *self.chosen.value();
        let default_role = self.default_assistant_role.clone();

        self.conversations.update(|list| {
            list.remove(index);
            if list.is_empty() {
                let fresh = Conversation::new(&default_role);
                debug!(conv_id = %fresh.id(), "Sequence emptied, creating default conversation");
                list.push(fresh);
            }
        })?;

        let len = self.conversations.value().len();
        let next = if current == index {
            index.saturating_sub(1)
        } else if current > index {
            current - 1
        } else {
            current
        };
        self.chosen.set(next.min(len - 1))?;

        debug!(conv_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Set a conversation's display title
    pub fn rename_conversation(&mut self, id: &str, title: &str) -> RepositoryResult<()> {
        let index = self.index_of(id)?;
        let title = title.to_string();
        self.conversations.update(|list| list[index].set_title(title))?;
        Ok(())
    }

    /// Zero a conversation's running token count
    pub fn reset_tokens(&mut self, id: &str) -> RepositoryResult<()> {
        let index = self.index_of(id)?;
        self.conversations.update(|list| list[index].reset_tokens())?;
        Ok(())
    }

    pub fn conversations(&self) -> &[Conversation] {
        self.conversations.value()
    }

    pub fn chosen_index(&self) -> usize {
        *self.chosen.value()
    }

    /// The currently chosen conversation (always resolves)
    pub fn chosen(&self) -> &Conversation {
        &self.conversations.value()[*self.chosen.value()]
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.value().iter().find(|c| c.id() == id)
    }

    /// Snapshot of a conversation's history (for stream payloads)
    pub fn history(&self, id: &str) -> RepositoryResult<Vec<Message>> {
        self.get(id)
            .map(|c| c.history().to_vec())
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })
    }

    /// All-time combined token total across conversations
    pub fn combined_tokens(&self) -> u64 {
        *self.combined_tokens.value()
    }

    fn index_of(&self, id: &str) -> RepositoryResult<usize> {
        self.conversations
            .value()
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::storage::InMemoryStore;

    const ROLE: &str = "You are a helpful assistant.";

    fn repo() -> (ConversationRepository, Arc<InMemoryStore>) {
        let backend = Arc::new(InMemoryStore::new());
        let repo = ConversationRepository::load(backend.clone(), ROLE);
        (repo, backend)
    }

    #[test]
    fn test_load_creates_default_conversation() {
        let (repo, _) = repo();
        assert_eq!(repo.conversations().len(), 1);
        assert_eq!(repo.chosen_index(), 0);
        assert_eq!(repo.chosen().assistant_role(), ROLE);
    }

    #[test]
    fn test_create_appends_and_chooses() {
        let (mut repo, _) = repo();
        let id = repo.create_conversation(None);
        assert_eq!(repo.conversations().len(), 2);
        assert_eq!(repo.chosen_index(), 1);
        assert_eq!(repo.chosen().id(), id);
    }

    #[test]
    fn test_select_unknown_id_leaves_state_unchanged() {
        let (mut repo, _) = repo();
        repo.create_conversation(None);
        let err = repo.select_conversation("no-such-id").unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
        assert_eq!(repo.chosen_index(), 1);
    }

    #[test]
    fn test_token_accounting_accumulates_and_clamps() {
        let (mut repo, _) = repo();
        let id = repo.chosen().id().to_string();

        repo.append_message(&id, Message::user("a", vec![]), 5).unwrap();
        repo.append_message(&id, Message::user("b", vec![]), 3).unwrap();
        assert_eq!(repo.get(&id).unwrap().tokens(), 8);
        assert_eq!(repo.combined_tokens(), 8);

        // Corrective negative delta clamps at zero and leaves the combined
        // total untouched
        repo.append_message(&id, Message::assistant("c"), -20).unwrap();
        assert_eq!(repo.get(&id).unwrap().tokens(), 0);
        assert_eq!(repo.combined_tokens(), 8);
    }

    #[test]
    fn test_delete_chosen_moves_to_preceding() {
        let (mut repo, _) = repo();
        let first = repo.chosen().id().to_string();
        let second = repo.create_conversation(None);
        let third = repo.create_conversation(None);
        assert_eq!(repo.chosen().id(), third);

        repo.delete_conversation(&third).unwrap();
        assert_eq!(repo.chosen().id(), second);

        repo.delete_conversation(&second).unwrap();
        assert_eq!(repo.chosen().id(), first);
    }

    #[test]
    fn test_delete_before_chosen_shifts_index() {
        let (mut repo, _) = repo();
        let first = repo.chosen().id().to_string();
        repo.create_conversation(None);
        let third = repo.create_conversation(None);

        repo.delete_conversation(&first).unwrap();
        assert_eq!(repo.chosen().id(), third);
    }

    #[test]
    fn test_delete_only_conversation_creates_fresh_default() {
        let (mut repo, _) = repo();
        let only = repo.chosen().id().to_string();

        repo.delete_conversation(&only).unwrap();

        assert_eq!(repo.conversations().len(), 1);
        assert_eq!(repo.chosen_index(), 0);
        assert_ne!(repo.chosen().id(), only);
        assert_eq!(repo.chosen().message_count(), 0);
    }

    #[test]
    fn test_rename() {
        let (mut repo, _) = repo();
        let id = repo.chosen().id().to_string();
        repo.rename_conversation(&id, "Trip planning").unwrap();
        assert_eq!(repo.get(&id).unwrap().title(), "Trip planning");

        assert!(repo.rename_conversation("ghost", "x").is_err());
    }

    #[test]
    fn test_reset_tokens() {
        let (mut repo, _) = repo();
        let id = repo.chosen().id().to_string();
        repo.append_message(&id, Message::user("a", vec![]), 11).unwrap();
        repo.reset_tokens(&id).unwrap();
        assert_eq!(repo.get(&id).unwrap().tokens(), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let (mut repo, backend) = repo();
        let first = repo.chosen().id().to_string();
        repo.append_message(&first, Message::user("hello", vec![]), 4).unwrap();
        let second = repo.create_conversation(Some("You are terse."));
        repo.append_message(&second, Message::assistant("hi"), 2).unwrap();
        repo.rename_conversation(&second, "Short one").unwrap();

        let reloaded = ConversationRepository::load(backend, ROLE);
        assert_eq!(reloaded.conversations(), repo.conversations());
        assert_eq!(reloaded.combined_tokens(), 6);
    }

    #[test]
    fn test_load_resets_chosen_to_last() {
        let (mut repo, backend) = repo();
        repo.create_conversation(None);
        repo.create_conversation(None);
        let first_id = repo.conversations()[0].id().to_string();
        repo.select_conversation(&first_id).unwrap();
        assert_eq!(repo.chosen_index(), 0);

        let reloaded = ConversationRepository::load(backend, ROLE);
        assert_eq!(reloaded.chosen_index(), 2);
    }

    #[test]
    fn test_chosen_always_valid_across_mixed_operations() {
        let (mut repo, _) = repo();
        for _ in 0..4 {
            repo.create_conversation(None);
        }
        // Delete in an arbitrary order, verifying the invariant after each
        while repo.conversations().len() > 1 {
            let id = repo.conversations()[0].id().to_string();
            repo.delete_conversation(&id).unwrap();
            assert!(repo.chosen_index() < repo.conversations().len());
        }
        assert!(!repo.conversations().is_empty());
    }
}
