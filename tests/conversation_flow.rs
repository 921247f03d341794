//! End-to-end tests for the conversation engine.
//!
//! Each test wires the real manager, tracker, responder, libsql store and
//! completion dispatcher together. Only the LLM and the record sink are
//! stubbed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use lead_assist::conversation::model::FieldSource;
use lead_assist::conversation::prompts;
use lead_assist::conversation::{
    CompletionEvent, ConversationLocks, ConversationManager, ConversationStatus, FieldTracker,
    InboundMessage,
};
use lead_assist::error::{LlmError, SinkError};
use lead_assist::llm::{
    Capabilities, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use lead_assist::rag::{KnowledgeBase, Responder};
use lead_assist::routes::{AppState, routes};
use lead_assist::schema::{FieldDefinition, FieldSchema, FieldType, FieldValue};
use lead_assist::sinks::{Dispatcher, RecordSink, spawn_dispatcher};
use lead_assist::store::{ConversationStore, LibSqlStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const CONVERSATION: &str = "wa:+34600000000";

/// Stub LLM: extraction prompts get a scripted JSON answer, everything else
/// gets a canned generated reply.
struct ScriptedLlm;

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let is_extraction = request
            .messages
            .first()
            .is_some_and(|m| m.content.contains("data extraction"));
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let content = if is_extraction {
            if prompt.contains("around 200k") {
                r#"{"budget": {"value": 200000, "confidence": 0.9}}"#.to_string()
            } else {
                "{}".to_string()
            }
        } else {
            "We cover Ruzafa, El Carmen and the coast.".to_string()
        };

        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Stub LLM that is always down.
struct DownLlm;

#[async_trait]
impl LlmProvider for DownLlm {
    fn model_name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "down".into(),
            reason: "503 Service Unavailable".into(),
        })
    }
}

/// Sink that records every submission.
#[derive(Default)]
struct RecordingSink {
    calls: AtomicUsize,
    records: Mutex<Vec<(String, BTreeMap<String, FieldValue>)>>,
}

#[async_trait]
impl RecordSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .await
            .push((conversation_id.to_string(), fields.clone()));
        Ok(())
    }
}

struct Engine {
    manager: Arc<ConversationManager>,
    store: Arc<dyn ConversationStore>,
    sink: Arc<RecordingSink>,
    dispatcher: JoinHandle<()>,
}

impl Engine {
    /// Drop the manager (closing the completion channel) and wait for the
    /// dispatcher to drain.
    async fn finish(self) -> (Arc<dyn ConversationStore>, Arc<RecordingSink>) {
        drop(self.manager);
        timeout(TEST_TIMEOUT, self.dispatcher)
            .await
            .expect("dispatcher hung")
            .unwrap();
        (self.store, self.sink)
    }
}

fn name_budget_schema() -> Arc<FieldSchema> {
    Arc::new(
        FieldSchema::new(vec![
            FieldDefinition::new("name", "What's your name?", FieldType::String).required(),
            FieldDefinition::new("budget", "What's your budget?", FieldType::Number)
                .required()
                .depends_on(&["name"]),
        ])
        .unwrap(),
    )
}

fn knowledge() -> KnowledgeBase {
    KnowledgeBase::from_json(
        r#"{"documents": [{"id": "faq-areas", "title": "Areas we cover",
            "content": "We work across Ruzafa, El Carmen and the coast."}]}"#,
    )
    .unwrap()
}

async fn engine(llm: Arc<dyn LlmProvider>) -> Engine {
    let schema = name_budget_schema();
    let store: Arc<dyn ConversationStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let locks = ConversationLocks::new();
    let sink = Arc::new(RecordingSink::default());

    let (tx, rx) = mpsc::channel::<CompletionEvent>(16);
    let dispatcher = spawn_dispatcher(
        Arc::new(Dispatcher::new(sink.clone(), store.clone(), locks.clone())),
        rx,
    );

    let capabilities = Capabilities::from_provider(llm);
    let tracker = FieldTracker::new(schema.clone(), capabilities.extractor);
    let responder = Responder::new(Arc::new(knowledge()), capabilities.generator);
    let manager = ConversationManager::new(schema, store.clone(), tracker, responder)
        .with_locks(locks)
        .with_completion_sender(tx);

    Engine {
        manager: Arc::new(manager),
        store,
        sink,
        dispatcher,
    }
}

fn msg(id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        conversation_id: CONVERSATION.into(),
        message_id: id.into(),
        text: text.into(),
        timestamp: Utc::now(),
    }
}

fn last_reply(outcome: &lead_assist::conversation::TurnOutcome) -> &str {
    outcome.replies.last().map(|r| r.text.as_str()).unwrap_or_default()
}

#[tokio::test]
async fn name_and_budget_scenario() {
    let engine = engine(Arc::new(ScriptedLlm)).await;
    let m = engine.manager.clone();

    let hi = m.handle(msg("m1", "Hi")).await.unwrap();
    assert_eq!(last_reply(&hi), "What's your name?");

    let name = m.handle(msg("m2", "Maria")).await.unwrap();
    assert_eq!(last_reply(&name), "What's your budget?");
    let state = m.conversation(CONVERSATION).await.unwrap().unwrap().value;
    assert_eq!(state.collected_fields["name"].source, FieldSource::UserStated);
    assert_eq!(state.pending_field_key.as_deref(), Some("budget"));

    let budget = m.handle(msg("m3", "around 200k")).await.unwrap();
    assert_eq!(budget.status, ConversationStatus::Completed);
    let event = budget.completion.clone().expect("completion event");
    assert_eq!(
        event.fields,
        BTreeMap::from([
            ("name".to_string(), FieldValue::Text("Maria".into())),
            ("budget".to_string(), FieldValue::Number(dec!(200000))),
        ])
    );

    // Redelivery of the completing message
    let again = m.handle(msg("m3", "around 200k")).await.unwrap();
    assert!(again.duplicate);
    assert!(again.completion.is_none());

    drop(m);
    let (store, sink) = engine.finish().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    let records = sink.records.lock().await;
    assert_eq!(records[0].0, CONVERSATION);

    let state = store.get(CONVERSATION).await.unwrap().unwrap().value;
    assert_eq!(state.collected_fields["budget"].source, FieldSource::Inferred);
    assert!(state.dispatch.acknowledged_at.is_some());
}

#[tokio::test]
async fn redelivery_changes_nothing() {
    let engine = engine(Arc::new(ScriptedLlm)).await;
    let m = engine.manager.clone();

    m.handle(msg("m1", "Hi")).await.unwrap();
    m.handle(msg("m2", "Maria")).await.unwrap();
    let before = m.conversation(CONVERSATION).await.unwrap().unwrap();
    let log_before = m.message_log(CONVERSATION).await.unwrap();

    for _ in 0..3 {
        let outcome = m.handle(msg("m2", "Maria")).await.unwrap();
        assert!(outcome.duplicate);
        assert!(outcome.replies.is_empty());
    }

    let after = m.conversation(CONVERSATION).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(log_before, m.message_log(CONVERSATION).await.unwrap());
}

#[tokio::test]
async fn concurrent_duplicates_dispatch_once() {
    let engine = engine(Arc::new(ScriptedLlm)).await;
    let m = engine.manager.clone();
    m.handle(msg("m1", "Hi")).await.unwrap();
    m.handle(msg("m2", "Maria")).await.unwrap();

    // Same completing message delivered eight times at once, plus a
    // different message that would also complete the conversation.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let m = m.clone();
        let (id, text) = if i == 7 { ("m4", "200000") } else { ("m3", "around 200k") };
        tasks.push(tokio::spawn(async move { m.handle(msg(id, text)).await }));
    }

    let mut completions = 0;
    for task in tasks {
        let outcome = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap().unwrap();
        if outcome.completion.is_some() {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    drop(m);
    let (store, sink) = engine.finish().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    let state = store.get(CONVERSATION).await.unwrap().unwrap().value;
    assert_eq!(state.status, ConversationStatus::Completed);
}

#[tokio::test]
async fn side_question_keeps_pending_field() {
    let engine = engine(Arc::new(ScriptedLlm)).await;
    let m = engine.manager.clone();
    m.handle(msg("m1", "Hi")).await.unwrap();
    m.handle(msg("m2", "Maria")).await.unwrap();

    let answer = m.handle(msg("m3", "Which areas do you cover?")).await.unwrap();
    let texts: Vec<&str> = answer.replies.iter().map(|r| r.text.as_str()).collect();
    assert!(texts.contains(&"We cover Ruzafa, El Carmen and the coast."));

    let state = m.conversation(CONVERSATION).await.unwrap().unwrap().value;
    assert_eq!(state.pending_field_key.as_deref(), Some("budget"));
    assert!(!state.collected_fields.contains_key("budget"));
}

#[tokio::test]
async fn literal_answers_survive_llm_outage() {
    let engine = engine(Arc::new(DownLlm)).await;
    let m = engine.manager.clone();

    m.handle(msg("m1", "Hi")).await.unwrap();
    m.handle(msg("m2", "Maria")).await.unwrap();

    // Questions fall back to a fixed reply
    let question = m.handle(msg("m3", "Do you have flats by the beach?")).await.unwrap();
    assert!(
        question
            .replies
            .iter()
            .any(|r| r.text == prompts::RETRIEVAL_FALLBACK)
    );

    let done = m.handle(msg("m4", "200,000")).await.unwrap();
    assert_eq!(done.status, ConversationStatus::Completed);

    drop(m);
    let (_, sink) = engine.finish().await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn webhook_over_http() {
    let engine = engine(Arc::new(ScriptedLlm)).await;
    let app = routes(AppState {
        manager: engine.manager.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/webhook/messages");
    let mut last: Value = Value::Null;
    for (id, text) in [("m1", "Hi"), ("m2", "Maria"), ("m3", "around 200k")] {
        let resp = timeout(
            TEST_TIMEOUT,
            client.post(&url).json(&msg(id, text)).send(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(resp.status().is_success());
        last = resp.json().await.unwrap();
    }

    assert_eq!(last["status"], "completed");
    assert_eq!(last["completed"], true);

    let state: Value = client
        .get(format!("http://127.0.0.1:{port}/api/conversations/{CONVERSATION}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["state"]["status"], "completed");
}
