//! Backend-agnostic behaviour checks shared by every `ConversationStore` test.
//!
//! Each check uses its own conversation ids, so one fresh store can run them all.

use chrono::Utc;
use rust_decimal_macros::dec;

use crate::conversation::model::{
    ConversationState, ConversationStatus, Direction, FieldSource, MessageLogEntry,
};
use crate::error::DatabaseError;
use crate::schema::FieldValue;
use crate::store::traits::ConversationStore;

pub async fn run_all(store: &dyn ConversationStore) {
    missing_conversation_reads_as_none(store).await;
    first_write_creates_version_one(store).await;
    stale_writes_conflict(store).await;
    state_round_trips(store).await;
    list_filters_by_status(store).await;
    log_keeps_entries_in_order(store).await;
}

fn sample(id: &str) -> ConversationState {
    ConversationState::new(id, Utc::now())
}

async fn missing_conversation_reads_as_none(store: &dyn ConversationStore) {
    assert!(store.get("conf-missing").await.unwrap().is_none());
}

async fn first_write_creates_version_one(store: &dyn ConversationStore) {
    let state = sample("conf-first");
    assert_eq!(store.put(&state, None).await.unwrap(), 1);

    // A second create loses against the existing row
    let err = store.put(&state, None).await.unwrap_err();
    assert!(matches!(
        err,
        DatabaseError::VersionConflict { expected: None, actual: Some(1), .. }
    ));

    // Updating a row that was never created also conflicts
    let err = store.put(&sample("conf-ghost"), Some(3)).await.unwrap_err();
    assert!(err.is_conflict());
}

async fn stale_writes_conflict(store: &dyn ConversationStore) {
    let mut state = sample("conf-stale");
    let v1 = store.put(&state, None).await.unwrap();

    state.pending_field_key = Some("name".into());
    let v2 = store.put(&state, Some(v1)).await.unwrap();
    assert_eq!(v2, v1 + 1);

    state.pending_field_key = Some("budget".into());
    let err = store.put(&state, Some(v1)).await.unwrap_err();
    match err {
        DatabaseError::VersionConflict { expected, actual, .. } => {
            assert_eq!(expected, Some(v1));
            assert_eq!(actual, Some(v2));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let stored = store.get("conf-stale").await.unwrap().unwrap();
    assert_eq!(stored.version, v2);
    assert_eq!(stored.value.pending_field_key.as_deref(), Some("name"));
}

async fn state_round_trips(store: &dyn ConversationStore) {
    let now = Utc::now();
    let mut state = sample("conf-roundtrip");
    state.set_field("name", FieldValue::Text("Maria".into()), FieldSource::UserStated, None, now);
    state.set_field("budget", FieldValue::Number(dec!(200000)), FieldSource::Inferred, Some(0.9), now);
    state.status = ConversationStatus::Completed;
    state.completed_at = Some(now);
    state.dispatch.triggered_at = Some(now);
    state.mark_processed("m1");

    store.put(&state, None).await.unwrap();
    let loaded = store.get("conf-roundtrip").await.unwrap().unwrap().value;
    assert_eq!(loaded, state);
}

async fn list_filters_by_status(store: &dyn ConversationStore) {
    let mut done = sample("conf-list-done");
    done.status = ConversationStatus::Abandoned;
    store.put(&done, None).await.unwrap();

    let abandoned = store
        .list_by_status(ConversationStatus::Abandoned)
        .await
        .unwrap();
    assert!(abandoned.iter().any(|v| v.value.conversation_id == "conf-list-done"));
    assert!(abandoned.iter().all(|v| v.value.status == ConversationStatus::Abandoned));

    let active = store.list_by_status(ConversationStatus::Active).await.unwrap();
    assert!(!active.iter().any(|v| v.value.conversation_id == "conf-list-done"));
}

async fn log_keeps_entries_in_order(store: &dyn ConversationStore) {
    let now = Utc::now();
    let mut state = sample("conf-log");
    for (i, dir) in [Direction::Inbound, Direction::Outbound].into_iter().enumerate() {
        state.append_log(
            MessageLogEntry {
                direction: dir,
                text: format!("entry {i}"),
                timestamp: now + chrono::Duration::seconds(i as i64),
                message_id: "m1".into(),
            },
            10,
        );
    }
    store.put(&state, None).await.unwrap();

    let log = store.message_log("conf-log").await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].text, "entry 0");
    assert_eq!(log[1].direction, Direction::Outbound);
    assert!(store.message_log("conf-missing").await.unwrap().is_empty());
}
