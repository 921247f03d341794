use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use lead_assist::config::EngineConfig;
use lead_assist::conversation::{
    ConversationLocks, ConversationManager, FieldTracker, InactivitySweep, spawn_sweep_task,
};
use lead_assist::llm::Capabilities;
use lead_assist::rag::{KnowledgeBase, Responder};
use lead_assist::routes::{AppState, routes};
use lead_assist::schema::FieldSchema;
use lead_assist::sinks::{
    Dispatcher, EmailSink, FanoutSink, LogSink, RecordSink, WebhookSink, spawn_dispatcher,
};
use lead_assist::store::{ConversationStore, InMemoryStore, LibSqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = EngineConfig::from_env()?;
    let _log_guard = lead_assist::logging::init(config.log_dir.as_deref())
        .context("Failed to set up logging")?;

    let llm_config = config.llm_config()?;
    eprintln!("🏠 Lead Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/messages", config.port);
    eprintln!("   Simulator: http://0.0.0.0:{}/api/simulator/messages", config.port);

    let capabilities = Capabilities::connect(&llm_config)?;

    // ── Schema & knowledge ──────────────────────────────────────────────
    let schema = Arc::new(match &config.schema_path {
        Some(path) => FieldSchema::load(path)?,
        None => FieldSchema::real_estate(),
    });
    eprintln!("   Fields: {}", schema.len());

    let knowledge = if config.knowledge_path.exists() {
        KnowledgeBase::load(&config.knowledge_path)?
    } else {
        tracing::warn!(path = %config.knowledge_path.display(), "Knowledge base not found, questions get the fallback reply");
        KnowledgeBase::new(Vec::new())
    };
    eprintln!("   Knowledge: {} documents", knowledge.len());

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn ConversationStore> = match &config.db_path {
        Some(path) => {
            eprintln!("   Database: {}", path.display());
            Arc::new(
                LibSqlStore::new_local(path)
                    .await
                    .with_context(|| format!("Failed to open database at {}", path.display()))?,
            )
        }
        None => {
            eprintln!("   Database: in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    // ── Sinks ───────────────────────────────────────────────────────────
    let mut sinks: Vec<Arc<dyn RecordSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = &config.sink_webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url.clone())?));
        eprintln!("   Sink: webhook {url}");
    }
    if let Some(email) = config.notify_email.clone() {
        eprintln!("   Sink: email to {}", email.to_addresses.join(", "));
        sinks.push(Arc::new(EmailSink::new(email)?));
    }
    let sink: Arc<dyn RecordSink> = Arc::new(FanoutSink::new(sinks));

    let locks = ConversationLocks::new();
    let (completion_tx, completion_rx) = mpsc::channel(256);
    let dispatcher = Arc::new(Dispatcher::new(sink, Arc::clone(&store), locks.clone()));
    let _dispatch_handle = spawn_dispatcher(dispatcher, completion_rx);

    // ── Engine ──────────────────────────────────────────────────────────
    let tracker = FieldTracker::new(Arc::clone(&schema), capabilities.extractor)
        .with_confidence_threshold(config.confidence_threshold)
        .with_extraction_timeout(config.extraction_timeout);
    let responder = Responder::new(
        Arc::new(knowledge.with_top_n(config.rag_top_n)),
        capabilities.generator,
    )
    .with_top_n(config.rag_top_n)
    .with_timeouts(config.retrieval_timeout, config.generation_timeout);

    let manager = Arc::new(
        ConversationManager::new(Arc::clone(&schema), Arc::clone(&store), tracker, responder)
            .with_config(config.manager_config())
            .with_locks(locks.clone())
            .with_completion_sender(completion_tx),
    );

    let sweep = Arc::new(InactivitySweep::new(
        schema,
        store,
        locks,
        config.manager_config().inactivity,
    ));
    let _sweep_handle = spawn_sweep_task(sweep, config.sweep_interval);

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = routes(AppState { manager });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Lead Assist listening");
    axum::serve(listener, app).await?;

    Ok(())
}
