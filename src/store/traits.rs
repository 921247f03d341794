//! `ConversationStore` trait: versioned persistence of conversation state.
//!
//! Writes are optimistic. `put` carries the version the caller loaded; if the
//! stored version differs the write is rejected with
//! `DatabaseError::VersionConflict` and the caller reloads and reapplies.

use async_trait::async_trait;

use crate::conversation::model::{ConversationState, ConversationStatus, MessageLogEntry};
use crate::error::DatabaseError;

/// A stored value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation, or `None` if it has never been written.
    async fn get(&self, conversation_id: &str)
    -> Result<Option<Versioned<ConversationState>>, DatabaseError>;

    /// Write `state` if the stored version still equals `expected_version`.
    ///
    /// `None` means "must not exist yet". Returns the new version; the first
    /// write of a conversation yields version 1.
    async fn put(
        &self,
        state: &ConversationState,
        expected_version: Option<u64>,
    ) -> Result<u64, DatabaseError>;

    /// Every conversation currently in `status`.
    async fn list_by_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Versioned<ConversationState>>, DatabaseError>;

    /// Full message history for a conversation, oldest first.
    ///
    /// Backends that keep no history beyond the live window return the window.
    async fn message_log(&self, conversation_id: &str) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        Ok(self
            .get(conversation_id)
            .await?
            .map(|v| v.value.message_log.into_iter().collect())
            .unwrap_or_default())
    }
}
