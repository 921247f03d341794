//! Conversation state and the message types exchanged with the transport.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::FieldValue;

/// Number of processed inbound message ids remembered for deduplication.
pub const DEDUP_WINDOW: usize = 1024;

/// Lifecycle of a conversation.
///
/// `Active ⇄ AwaitingClarification → Completed`, and either non-terminal
/// status → `Abandoned` through the inactivity sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    AwaitingClarification,
    Completed,
    Abandoned,
}

impl ConversationStatus {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: ConversationStatus) -> bool {
        use ConversationStatus::*;
        matches!(
            (self, target),
            (Active, Active)
                | (Active, AwaitingClarification)
                | (AwaitingClarification, Active)
                | (AwaitingClarification, AwaitingClarification)
                | (Active | AwaitingClarification, Completed)
                | (Active | AwaitingClarification, Abandoned)
        )
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "awaiting_clarification" => Ok(Self::AwaitingClarification),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// Where a collected value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    UserStated,
    Inferred,
    Corrected,
}

/// The live value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedFieldValue {
    pub key: String,
    pub value: FieldValue,
    pub source: FieldSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub last_updated_at: DateTime<Utc>,
}

/// A superseded value, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldHistoryEntry {
    pub previous: CollectedFieldValue,
    pub replaced_at: DateTime<Utc>,
    /// Set when the value was cleared by `/restart` rather than replaced.
    #[serde(default)]
    pub cleared: bool,
}

/// A low-confidence extraction waiting for the user to confirm it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub field_key: String,
    pub candidate: FieldValue,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

/// Completion-trigger bookkeeping.
///
/// `triggered_at` is written in the same store write as the `Completed`
/// transition; `acknowledged_at` is the only field that may change after the
/// conversation is terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of writing a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    Inserted,
    Replaced,
    Unchanged,
}

/// Per-user conversation state, owned by the conversation manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub status: ConversationStatus,
    #[serde(default)]
    pub collected_fields: BTreeMap<String, CollectedFieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_field_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    /// Most recent log entries; the full history lives in the store's log table.
    #[serde(default)]
    pub message_log: VecDeque<MessageLogEntry>,
    #[serde(default)]
    pub processed_message_ids: VecDeque<String>,
    #[serde(default)]
    pub field_history: Vec<FieldHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch: DispatchState,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            status: ConversationStatus::Active,
            collected_fields: BTreeMap::new(),
            pending_field_key: None,
            clarification: None,
            message_log: VecDeque::new(),
            processed_message_ids: VecDeque::new(),
            field_history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            completed_at: None,
            abandoned_at: None,
            dispatch: DispatchState::default(),
        }
    }

    /// Whether this inbound message id was already ingested.
    pub fn has_processed(&self, message_id: &str) -> bool {
        self.processed_message_ids.iter().any(|id| id == message_id)
    }

    pub fn mark_processed(&mut self, message_id: &str) {
        self.processed_message_ids.push_back(message_id.to_string());
        while self.processed_message_ids.len() > DEDUP_WINDOW {
            self.processed_message_ids.pop_front();
        }
    }

    /// Append to the log window, evicting the oldest entries beyond `max`.
    pub fn append_log(&mut self, entry: MessageLogEntry, max: usize) {
        self.message_log.push_back(entry);
        while self.message_log.len() > max.max(1) {
            self.message_log.pop_front();
        }
    }

    pub fn is_satisfied(&self, key: &str) -> bool {
        self.collected_fields.contains_key(key)
    }

    pub fn value_of(&self, key: &str) -> Option<&FieldValue> {
        self.collected_fields.get(key).map(|c| &c.value)
    }

    /// Latest write wins; a different prior value moves to `field_history`
    /// and the new value is marked `Corrected`.
    pub fn set_field(
        &mut self,
        key: &str,
        value: FieldValue,
        source: FieldSource,
        confidence: Option<f32>,
        now: DateTime<Utc>,
    ) -> FieldChange {
        if let Some(existing) = self.collected_fields.get(key)
            && existing.value == value
        {
            return FieldChange::Unchanged;
        }

        let new = |source| CollectedFieldValue {
            key: key.to_string(),
            value: value.clone(),
            source,
            confidence,
            last_updated_at: now,
        };

        match self.collected_fields.remove(key) {
            Some(previous) => {
                self.field_history.push(FieldHistoryEntry {
                    previous,
                    replaced_at: now,
                    cleared: false,
                });
                self.collected_fields
                    .insert(key.to_string(), new(FieldSource::Corrected));
                FieldChange::Replaced
            }
            None => {
                self.collected_fields.insert(key.to_string(), new(source));
                FieldChange::Inserted
            }
        }
    }

    /// Drop every live value (history keeps them) and start over.
    pub fn reset_fields(&mut self, now: DateTime<Utc>) {
        let cleared = std::mem::take(&mut self.collected_fields);
        self.field_history
            .extend(cleared.into_values().map(|previous| FieldHistoryEntry {
                previous,
                replaced_at: now,
                cleared: true,
            }));
        self.pending_field_key = None;
        self.clarification = None;
    }

    /// Collected values as a plain key → value map.
    pub fn field_values(&self) -> BTreeMap<String, FieldValue> {
        self.collected_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

/// One message delivered by the messaging transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// One reply for the transport to send back on the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Trigger for downstream record persistence and notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub conversation_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub completed_at: DateTime<Utc>,
}
