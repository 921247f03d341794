//! ConversationManager: runs one inbound message through the whole turn.
//!
//! Per message: lock the conversation, load it, drop duplicates, run the
//! field tracker and/or the responder, check completion, then persist with an
//! optimistic version check. A lost race reloads and replays the turn against
//! the fresh state, reusing capability results already fetched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::classify::{Command, MessageKind, classify};
use super::completion;
use super::locks::ConversationLocks;
use super::model::{
    CompletionEvent, ConversationState, ConversationStatus, Direction, InboundMessage,
    MessageLogEntry, OutboundMessage,
};
use super::prompts;
use super::tracker::{Extraction, FieldTracker, TrackerOutcome, next_pending};
use crate::error::{CapabilityError, ConversationError, DatabaseError};
use crate::rag::{Responder, RetrievalResult};
use crate::schema::FieldSchema;
use crate::store::{ConversationStore, Versioned};

/// Tunables for the turn loop.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Idle time after which the sweep abandons a conversation.
    pub inactivity: chrono::Duration,
    /// Log entries kept in the live state.
    pub max_log_entries: usize,
    /// Attempts per turn before giving up on version conflicts.
    pub store_max_attempts: u32,
    pub store_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            inactivity: chrono::Duration::hours(24),
            max_log_entries: 200,
            store_max_attempts: 3,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Replies in the order they should be sent.
    pub replies: Vec<OutboundMessage>,
    /// Set only on the turn whose write made the conversation complete.
    pub completion: Option<CompletionEvent>,
    /// The message id was already processed; nothing changed.
    pub duplicate: bool,
    pub status: ConversationStatus,
}

impl TurnOutcome {
    fn duplicate(status: ConversationStatus) -> Self {
        Self {
            replies: Vec::new(),
            completion: None,
            duplicate: true,
            status,
        }
    }
}

/// Capability results fetched during a turn, kept across replays.
#[derive(Default)]
struct TurnCache {
    extraction: Option<Extraction>,
    retrieval: Option<Result<RetrievalResult, CapabilityError>>,
}

pub struct ConversationManager {
    schema: Arc<FieldSchema>,
    store: Arc<dyn ConversationStore>,
    tracker: FieldTracker,
    responder: Responder,
    locks: ConversationLocks,
    config: ManagerConfig,
    completions: Option<mpsc::Sender<CompletionEvent>>,
}

impl ConversationManager {
    pub fn new(
        schema: Arc<FieldSchema>,
        store: Arc<dyn ConversationStore>,
        tracker: FieldTracker,
        responder: Responder,
    ) -> Self {
        Self {
            schema,
            store,
            tracker,
            responder,
            locks: ConversationLocks::new(),
            config: ManagerConfig::default(),
            completions: None,
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a lock map with other writers (the sweep, the dispatcher).
    pub fn with_locks(mut self, locks: ConversationLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Completion events are forwarded here after the completing write.
    pub fn with_completion_sender(mut self, tx: mpsc::Sender<CompletionEvent>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    pub async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Versioned<ConversationState>>, DatabaseError> {
        self.store.get(conversation_id).await
    }

    pub async fn message_log(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        self.store.message_log(conversation_id).await
    }

    pub async fn handle(&self, inbound: InboundMessage) -> Result<TurnOutcome, ConversationError> {
        self.handle_at(inbound, Utc::now()).await
    }

    /// Handle `inbound` as if the current time were `now`.
    pub async fn handle_at(
        &self,
        inbound: InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome, ConversationError> {
        if inbound.conversation_id.trim().is_empty() {
            return Err(ConversationError::InvalidMessage("empty conversation id".into()));
        }
        if inbound.message_id.trim().is_empty() {
            return Err(ConversationError::InvalidMessage("empty message id".into()));
        }

        let conversation_id = inbound.conversation_id.as_str();
        let guard = self.locks.acquire(conversation_id).await;
        let kind = classify(&inbound.text);
        let mut cache = TurnCache::default();
        let attempts = self.config.store_max_attempts.max(1);

        for attempt in 1..=attempts {
            let loaded = self
                .with_store_timeout(self.store.get(conversation_id))
                .await
                .map_err(ConversationError::StoreUnavailable)?;

            let (mut state, version) = match loaded {
                Some(v) => (v.value, Some(v.version)),
                None => (ConversationState::new(conversation_id, now), None),
            };

            if state.has_processed(&inbound.message_id) {
                debug!(conversation_id, message_id = %inbound.message_id, "Duplicate delivery");
                return Ok(TurnOutcome::duplicate(state.status));
            }

            if state.status.is_terminal() {
                debug!(conversation_id, status = %state.status, "Message for closed conversation");
                return Ok(TurnOutcome {
                    replies: vec![OutboundMessage::new(prompts::terminal_reply(state.status))],
                    completion: None,
                    duplicate: false,
                    status: state.status,
                });
            }

            let outcome = self
                .run_turn(&mut state, version.is_none(), &inbound, kind, &mut cache, now)
                .await;

            match self
                .with_store_timeout(self.store.put(&state, version))
                .await
            {
                Ok(new_version) => {
                    debug!(conversation_id, version = new_version, status = %state.status, "Turn persisted");
                    drop(guard);
                    if let Some(event) = &outcome.completion {
                        self.forward_completion(event.clone()).await;
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_conflict() => {
                    warn!(conversation_id, attempt, error = %e, "Store conflict, replaying turn");
                    if attempt < attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(ConversationError::StoreUnavailable(e)),
            }
        }

        Err(ConversationError::StoreWriteConflict {
            conversation_id: conversation_id.to_string(),
            attempts,
        })
    }

    /// Apply one message to `state` and compose the replies. Nothing is
    /// persisted here.
    async fn run_turn(
        &self,
        state: &mut ConversationState,
        is_new: bool,
        inbound: &InboundMessage,
        kind: MessageKind,
        cache: &mut TurnCache,
        now: DateTime<Utc>,
    ) -> TurnOutcome {
        let mut replies: Vec<String> = Vec::new();
        let pending_before = state.pending_field_key.clone();
        state.last_activity_at = now;

        if is_new {
            replies.push(prompts::WELCOME.to_string());
        }

        let mut tracked = None;
        match kind {
            MessageKind::Command(Command::Help) => replies.push(prompts::help(&self.schema)),
            MessageKind::Command(Command::Status) => {
                replies.push(prompts::status(state, &self.schema))
            }
            MessageKind::Command(Command::Restart) => {
                state.reset_fields(now);
                replies.push(prompts::RESTARTED.to_string());
            }
            _ => {
                if self.tracker.needs_extraction(state, kind) && cache.extraction.is_none() {
                    cache.extraction = Some(self.tracker.extract(&inbound.text).await);
                }
                let no_extraction: Extraction = Ok(HashMap::new());
                let extraction = cache.extraction.as_ref().unwrap_or(&no_extraction);
                let outcome = self
                    .tracker
                    .apply(state, &inbound.text, kind, extraction, now);

                if outcome.extraction_unavailable {
                    info!(conversation_id = %state.conversation_id, "Turn ran without extraction");
                }
                if let Some(ack) = prompts::acknowledge(
                    &outcome
                        .updated_fields
                        .iter()
                        .map(|u| (u.key.clone(), u.value.clone()))
                        .collect::<Vec<_>>(),
                ) {
                    replies.push(ack);
                }

                let wants_answer = kind == MessageKind::Question
                    || (pending_before.is_none()
                        && kind == MessageKind::Statement
                        && outcome.updated_fields.is_empty()
                        && outcome.clarification.is_none());
                if wants_answer {
                    replies.push(self.retrieval_reply(state, &inbound.text, cache).await);
                }
                tracked = Some(outcome);
            }
        }

        if state.clarification.is_none() && state.pending_field_key.is_none() {
            state.pending_field_key = next_pending(&self.schema, state);
        }

        let check = completion::check(state, &self.schema, now, self.config.inactivity);
        let mut completion = None;
        if check.completes(state) {
            state.status = ConversationStatus::Completed;
            state.completed_at = Some(now);
            state.dispatch.triggered_at = Some(now);
            state.pending_field_key = None;
            state.clarification = None;
            info!(conversation_id = %state.conversation_id, "Conversation completed");
            completion = Some(CompletionEvent {
                conversation_id: state.conversation_id.clone(),
                fields: state.field_values(),
                completed_at: now,
            });
            replies.push(prompts::completion_summary(state, &self.schema));
        } else if state.status.can_transition_to(check.status) {
            state.status = check.status;
            replies.extend(self.next_prompts(state, tracked.as_ref()));
        }

        // Log inbound then outbound, and remember the message id.
        let max = self.config.max_log_entries;
        state.append_log(
            MessageLogEntry {
                direction: Direction::Inbound,
                text: inbound.text.clone(),
                timestamp: inbound.timestamp,
                message_id: inbound.message_id.clone(),
            },
            max,
        );
        for (i, text) in replies.iter().enumerate() {
            state.append_log(
                MessageLogEntry {
                    direction: Direction::Outbound,
                    text: text.clone(),
                    timestamp: now,
                    message_id: format!("{}#{}", inbound.message_id, i + 1),
                },
                max,
            );
        }
        state.mark_processed(&inbound.message_id);

        TurnOutcome {
            replies: replies.into_iter().map(OutboundMessage::new).collect(),
            completion,
            duplicate: false,
            status: state.status,
        }
    }

    /// Rejection, clarification, or the next question.
    fn next_prompts(&self, state: &ConversationState, tracked: Option<&TrackerOutcome>) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(clarification) = &state.clarification {
            out.push(prompts::confirm(&clarification.field_key, &clarification.candidate));
            return out;
        }

        let pending = state
            .pending_field_key
            .as_deref()
            .and_then(|k| self.schema.get(k));

        if let Some(t) = tracked {
            if let Some(key) = &t.declined {
                out.push(prompts::declined(key));
            }
            if let Some(rejection) = &t.rejected
                && let Some(def) = self.schema.get(&rejection.field_key)
            {
                out.push(prompts::rejected(def, &rejection.error));
            }
        }

        if let Some(def) = pending {
            out.push(prompts::ask(def));
        }
        out
    }

    async fn retrieval_reply(
        &self,
        state: &ConversationState,
        query: &str,
        cache: &mut TurnCache,
    ) -> String {
        if cache.retrieval.is_none() {
            cache.retrieval = Some(self.responder.answer(query, &state.field_values()).await);
        }
        match cache.retrieval.as_ref() {
            Some(Ok(result)) => result.generated_answer.clone(),
            Some(Err(e)) => {
                warn!(conversation_id = %state.conversation_id, error = %e, "Retrieval answer unavailable");
                prompts::RETRIEVAL_FALLBACK.to_string()
            }
            None => prompts::RETRIEVAL_FALLBACK.to_string(),
        }
    }

    async fn forward_completion(&self, event: CompletionEvent) {
        let Some(tx) = &self.completions else {
            return;
        };
        let conversation_id = event.conversation_id.clone();
        if let Err(e) = tx.send(event).await {
            tracing::error!(%conversation_id, error = %e, "Completion dispatcher is gone");
        }
    }

    async fn with_store_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, DatabaseError> {
        timeout(self.config.store_timeout, fut)
            .await
            .unwrap_or(Err(DatabaseError::Timeout(self.config.store_timeout)))
    }
}

/// Jittered linear backoff between replays.
fn backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..25u64);
    Duration::from_millis(20 * attempt as u64 + jitter)
}
