use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::message::Message;

pub type ConversationId = String;

/// A titled, persisted thread of messages with its own token count and
/// assistant role (system prompt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    id: ConversationId,
    title: String,
    assistant_role: String,
    history: Vec<Message>,
    conversation_tokens: u64,
    created_at: i64,
    updated_at: i64,
}

impl Conversation {
    /// Create a new empty conversation
    pub fn new(assistant_role: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            assistant_role: assistant_role.into(),
            history: Vec::new(),
            conversation_tokens: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    pub fn assistant_role(&self) -> &str {
        &self.assistant_role
    }

    /// Get the complete message history
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn message_count(&self) -> usize {
        self.history.len()
    }

    /// Append a message to the history
    pub fn push_message(&mut self, message: Message) {
        self.history.push(message);
        self.touch();
    }

    pub fn tokens(&self) -> u64 {
        self.conversation_tokens
    }

    /// Adjust the running token count. Negative deltas are corrective
    /// adjustments and never drive the total below zero.
    pub fn add_tokens(&mut self, delta: i64) {
        if delta >= 0 {
            self.conversation_tokens += delta as u64;
        } else {
            self.conversation_tokens = self.conversation_tokens.saturating_sub(delta.unsigned_abs());
        }
        self.touch();
    }

    pub fn reset_tokens(&mut self) {
        self.conversation_tokens = 0;
        self.touch();
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation_is_empty() {
        let conv = Conversation::new("You are a helpful assistant.");
        assert!(conv.title().is_empty());
        assert_eq!(conv.message_count(), 0);
        assert_eq!(conv.tokens(), 0);
    }

    #[test]
    fn test_add_tokens_accumulates() {
        let mut conv = Conversation::new("role");
        conv.add_tokens(5);
        conv.add_tokens(3);
        assert_eq!(conv.tokens(), 8);
    }

    #[test]
    fn test_negative_delta_clamps_at_zero() {
        let mut conv = Conversation::new("role");
        conv.add_tokens(5);
        conv.add_tokens(-20);
        assert_eq!(conv.tokens(), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let mut conv = Conversation::new("role");
        conv.push_message(Message::user("hi", vec![]));
        conv.add_tokens(12);
        conv.set_title("greetings");

        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conv);
    }
}
