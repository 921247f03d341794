//! Completion checker: derives the status a conversation should have.
//!
//! Pure and deterministic. The manager applies the result; the checker never
//! mutates state.

use chrono::{DateTime, Duration, Utc};

use super::model::{ConversationState, ConversationStatus};
use crate::schema::FieldSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReason {
    /// Status is terminal and is reported unchanged.
    AlreadyTerminal,
    AllRequiredCollected,
    Inactive,
    ClarificationOutstanding,
    /// Required keys still missing, in declaration order.
    Missing(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCheck {
    pub status: ConversationStatus,
    pub reason: CompletionReason,
}

impl CompletionCheck {
    /// Whether applying this check moves `state` into `Completed`.
    pub fn completes(&self, state: &ConversationState) -> bool {
        self.status == ConversationStatus::Completed && state.status != ConversationStatus::Completed
    }
}

pub fn check(
    state: &ConversationState,
    schema: &FieldSchema,
    now: DateTime<Utc>,
    inactivity: Duration,
) -> CompletionCheck {
    if state.status.is_terminal() {
        return CompletionCheck {
            status: state.status,
            reason: CompletionReason::AlreadyTerminal,
        };
    }

    let missing: Vec<String> = schema
        .required()
        .filter(|f| !state.is_satisfied(&f.key))
        .map(|f| f.key.clone())
        .collect();

    if missing.is_empty() {
        return CompletionCheck {
            status: ConversationStatus::Completed,
            reason: CompletionReason::AllRequiredCollected,
        };
    }

    if now - state.last_activity_at > inactivity {
        return CompletionCheck {
            status: ConversationStatus::Abandoned,
            reason: CompletionReason::Inactive,
        };
    }

    if state.clarification.is_some() {
        return CompletionCheck {
            status: ConversationStatus::AwaitingClarification,
            reason: CompletionReason::ClarificationOutstanding,
        };
    }

    CompletionCheck {
        status: ConversationStatus::Active,
        reason: CompletionReason::Missing(missing),
    }
}
