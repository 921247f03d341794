//! In-process `ConversationStore` used for tests and `LEAD_ASSIST_DB_PATH=memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::conversation::model::{ConversationState, ConversationStatus};
use crate::error::DatabaseError;
use crate::store::traits::{ConversationStore, Versioned};

#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Versioned<ConversationState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Versioned<ConversationState>>, DatabaseError> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn put(
        &self,
        state: &ConversationState,
        expected_version: Option<u64>,
    ) -> Result<u64, DatabaseError> {
        let mut conversations = self.conversations.write().await;
        let actual = conversations
            .get(&state.conversation_id)
            .map(|v| v.version);

        if actual != expected_version {
            return Err(DatabaseError::VersionConflict {
                id: state.conversation_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        let version = actual.unwrap_or(0) + 1;
        conversations.insert(
            state.conversation_id.clone(),
            Versioned {
                value: state.clone(),
                version,
            },
        );
        Ok(version)
    }

    async fn list_by_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Versioned<ConversationState>>, DatabaseError> {
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .filter(|v| v.value.status == status)
            .cloned()
            .collect())
    }
}
