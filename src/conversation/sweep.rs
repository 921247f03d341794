//! Inactivity sweep: the only path into `Abandoned`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::completion;
use super::locks::ConversationLocks;
use super::model::ConversationStatus;
use crate::error::DatabaseError;
use crate::schema::FieldSchema;
use crate::store::ConversationStore;

pub struct InactivitySweep {
    schema: Arc<FieldSchema>,
    store: Arc<dyn ConversationStore>,
    locks: ConversationLocks,
    inactivity: chrono::Duration,
}

impl InactivitySweep {
    pub fn new(
        schema: Arc<FieldSchema>,
        store: Arc<dyn ConversationStore>,
        locks: ConversationLocks,
        inactivity: chrono::Duration,
    ) -> Self {
        Self {
            schema,
            store,
            locks,
            inactivity,
        }
    }

    /// Abandon every open conversation idle for longer than the limit.
    /// Returns how many were closed. A failure on one conversation is logged
    /// and skipped; only a failed listing aborts the pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut closed = 0;

        for status in [ConversationStatus::Active, ConversationStatus::AwaitingClarification] {
            for candidate in self.store.list_by_status(status).await? {
                let check = completion::check(&candidate.value, &self.schema, now, self.inactivity);
                if check.status != ConversationStatus::Abandoned {
                    continue;
                }

                let id = candidate.value.conversation_id.clone();
                let _guard = self.locks.acquire(&id).await;

                // A turn may have landed between the listing and the lock
                let current = match self.store.get(&id).await {
                    Ok(Some(current)) => current,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(conversation_id = %id, error = %e, "Sweep could not reload conversation");
                        continue;
                    }
                };
                let mut state = current.value;
                let check = completion::check(&state, &self.schema, now, self.inactivity);
                if check.status != ConversationStatus::Abandoned {
                    debug!(conversation_id = %id, "Conversation active again, skipping");
                    continue;
                }

                state.status = ConversationStatus::Abandoned;
                state.abandoned_at = Some(now);
                state.pending_field_key = None;
                state.clarification = None;

                match self.store.put(&state, Some(current.version)).await {
                    Ok(_) => {
                        info!(conversation_id = %id, last_activity = %state.last_activity_at, "Conversation abandoned");
                        closed += 1;
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(conversation_id = %id, "Conversation changed during sweep, skipping");
                    }
                    Err(e) => {
                        warn!(conversation_id = %id, error = %e, "Sweep could not abandon conversation");
                    }
                }
            }
        }

        let pruned = self.locks.cleanup_unused().await;
        if closed > 0 || pruned > 0 {
            info!(closed, pruned_locks = pruned, "Inactivity sweep finished");
        }
        Ok(closed)
    }
}

/// Spawn a background task that periodically runs the sweep.
pub fn spawn_sweep_task(sweep: Arc<InactivitySweep>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = sweep.run_once(Utc::now()).await {
                warn!(error = %e, "Inactivity sweep failed");
            }
        }
    })
}
