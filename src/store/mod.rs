//! Conversation storage
//!
//! Narrow async trait so the HTTP layer and finalizer never care where
//! conversations live. The in-memory implementation is the default backend.

use crate::models::{Conversation, Message};
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;
    async fn create_conversation(&self, conversation: Conversation) -> Result<()>;
    /// Append-only; messages are never rewritten in place.
    async fn append_messages(&self, conversation_id: Uuid, messages: Vec<Message>) -> Result<()>;
    async fn delete_conversation(&self, id: Uuid) -> Result<bool>;
}

// ================= In-Memory Store =================

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<Uuid, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation);
        Ok(())
    }

    async fn append_messages(&self, conversation_id: Uuid, messages: Vec<Message>) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| AgentError::StoreError(format!(
                "conversation not found: {}",
                conversation_id
            )))?;
        conversation.messages.extend(messages);
        Ok(())
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        Ok(self.conversations.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryConversationStore::new();
        let user_id = Uuid::new_v4();
        let conversation = Conversation::new(Uuid::new_v4(), user_id, "hello");
        let id = conversation.id;

        store.create_conversation(conversation).await.unwrap();
        let fetched = store.get_conversation(id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, user_id);
        assert!(fetched.messages.is_empty());
    }

    #[tokio::test]
    async fn test_append_messages() {
        let store = InMemoryConversationStore::new();
        let conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4(), "hello");
        let id = conversation.id;
        store.create_conversation(conversation).await.unwrap();

        let message = Message::user_text(id, Uuid::new_v4(), "hello");
        store.append_messages(id, vec![message]).await.unwrap();

        let fetched = store.get_conversation(id).await.unwrap().unwrap();
        assert_eq!(fetched.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_append_to_missing_conversation_fails() {
        let store = InMemoryConversationStore::new();
        let result = store
            .append_messages(Uuid::new_v4(), vec![])
            .await;
        assert!(matches!(result, Err(AgentError::StoreError(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryConversationStore::new();
        let conversation = Conversation::new(Uuid::new_v4(), Uuid::new_v4(), "hello");
        let id = conversation.id;
        store.create_conversation(conversation).await.unwrap();

        assert!(store.delete_conversation(id).await.unwrap());
        assert!(!store.delete_conversation(id).await.unwrap());
        assert!(store.get_conversation(id).await.unwrap().is_none());
    }
}
