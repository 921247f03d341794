//! Completion dispatcher: hands each completion event to the sink once and
//! records the outcome on the conversation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::RecordSink;
use crate::conversation::{CompletionEvent, ConversationLocks};
use crate::error::{DatabaseError, SinkError};
use crate::store::ConversationStore;

/// How many times the acknowledgement write is replayed on a version conflict.
const ACK_MAX_ATTEMPTS: u32 = 3;

pub struct Dispatcher {
    sink: Arc<dyn RecordSink>,
    store: Arc<dyn ConversationStore>,
    locks: ConversationLocks,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        store: Arc<dyn ConversationStore>,
        locks: ConversationLocks,
    ) -> Self {
        Self { sink, store, locks }
    }

    /// Submit the record, then persist the acknowledgement or the error.
    ///
    /// The sink is called at most once per event. A failed submission is
    /// recorded in `dispatch.last_error` and not retried.
    pub async fn dispatch(&self, event: &CompletionEvent) -> Result<(), SinkError> {
        let id = &event.conversation_id;

        match self.store.get(id).await {
            Ok(Some(current)) if current.value.dispatch.acknowledged_at.is_some() => {
                debug!(conversation_id = %id, "Record already acknowledged, skipping");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(conversation_id = %id, error = %e, "Could not read dispatch state"),
        }

        let result = self.sink.submit(id, &event.fields).await;
        match &result {
            Ok(()) => info!(conversation_id = %id, sink = self.sink.name(), "Lead record delivered"),
            Err(e) => error!(conversation_id = %id, sink = self.sink.name(), error = %e, "Lead record delivery failed"),
        }

        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        if let Err(e) = self.record_outcome(id, outcome).await {
            error!(conversation_id = %id, error = %e, "Failed to record dispatch outcome");
        }
        result
    }

    async fn record_outcome(&self, id: &str, outcome: Result<(), String>) -> Result<(), DatabaseError> {
        let _guard = self.locks.acquire(id).await;

        for attempt in 1..=ACK_MAX_ATTEMPTS {
            let Some(current) = self.store.get(id).await? else {
                warn!(conversation_id = %id, "Conversation vanished before acknowledgement");
                return Ok(());
            };
            let mut state = current.value;
            match &outcome {
                Ok(()) => {
                    state.dispatch.acknowledged_at = Some(Utc::now());
                    state.dispatch.last_error = None;
                }
                Err(reason) => state.dispatch.last_error = Some(reason.clone()),
            }

            match self.store.put(&state, Some(current.version)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < ACK_MAX_ATTEMPTS => {
                    debug!(conversation_id = %id, attempt, "Conflict recording dispatch, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Drain completion events until every sender is dropped.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::Receiver<CompletionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            // Errors are already logged and recorded on the conversation
            let _ = dispatcher.dispatch(&event).await;
        }
        info!("Completion dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::conversation::{ConversationState, ConversationStatus};
    use crate::schema::FieldValue;
    use crate::store::InMemoryStore;

    struct CountingSink {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl RecordSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn submit(
            &self,
            conversation_id: &str,
            _fields: &BTreeMap<String, FieldValue>,
        ) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SinkError::Rejected {
                    name: "counting".into(),
                    conversation_id: conversation_id.into(),
                    reason: "quota exceeded".into(),
                });
            }
            Ok(())
        }
    }

    async fn completed(store: &InMemoryStore) -> CompletionEvent {
        let now = Utc::now();
        let mut state = ConversationState::new("c1", now);
        state.status = ConversationStatus::Completed;
        state.completed_at = Some(now);
        state.dispatch.triggered_at = Some(now);
        store.put(&state, None).await.unwrap();
        CompletionEvent {
            conversation_id: "c1".into(),
            fields: BTreeMap::from([("budget".to_string(), FieldValue::Number(dec!(200000)))]),
            completed_at: now,
        }
    }

    #[tokio::test]
    async fn success_is_acknowledged() {
        let store = Arc::new(InMemoryStore::new());
        let event = completed(&store).await;
        let sink = CountingSink::new(false);
        let d = Dispatcher::new(sink.clone(), store.clone(), ConversationLocks::new());

        d.dispatch(&event).await.unwrap();

        let state = store.get("c1").await.unwrap().unwrap().value;
        assert!(state.dispatch.acknowledged_at.is_some());
        assert_eq!(state.dispatch.last_error, None);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acknowledged_record_is_not_resubmitted() {
        let store = Arc::new(InMemoryStore::new());
        let event = completed(&store).await;
        let sink = CountingSink::new(false);
        let d = Dispatcher::new(sink.clone(), store.clone(), ConversationLocks::new());

        d.dispatch(&event).await.unwrap();
        d.dispatch(&event).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_recorded_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        let event = completed(&store).await;
        let sink = CountingSink::new(true);
        let d = Dispatcher::new(sink.clone(), store.clone(), ConversationLocks::new());

        assert!(d.dispatch(&event).await.is_err());

        let state = store.get("c1").await.unwrap().unwrap().value;
        assert_eq!(state.dispatch.acknowledged_at, None);
        assert!(state.dispatch.last_error.unwrap().contains("quota exceeded"));
        assert_eq!(state.status, ConversationStatus::Completed);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_drains_channel() {
        let store = Arc::new(InMemoryStore::new());
        let event = completed(&store).await;
        let sink = CountingSink::new(false);
        let d = Arc::new(Dispatcher::new(sink.clone(), store.clone(), ConversationLocks::new()));

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_dispatcher(d, rx);
        tx.send(event).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }
}
