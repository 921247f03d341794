//! HTTP transport: messaging webhook, local simulator, and read-only
//! conversation inspection.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::conversation::{
    ConversationManager, ConversationStatus, InboundMessage, OutboundMessage, TurnOutcome,
};
use crate::error::{ConversationError, DatabaseError};

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConversationManager>,
}

/// Replies for one delivered message.
#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub conversation_id: String,
    pub message_id: String,
    pub replies: Vec<OutboundMessage>,
    pub status: ConversationStatus,
    pub duplicate: bool,
    pub completed: bool,
}

impl TurnResponse {
    fn new(inbound: &InboundMessage, outcome: TurnOutcome) -> Self {
        Self {
            conversation_id: inbound.conversation_id.clone(),
            message_id: inbound.message_id.clone(),
            completed: outcome.completion.is_some(),
            replies: outcome.replies,
            status: outcome.status,
            duplicate: outcome.duplicate,
        }
    }
}

/// Simulator input: ids and timestamp are filled in by the server.
#[derive(Debug, Deserialize)]
pub struct SimulatorMessage {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub text: String,
}

/// Errors surfaced to HTTP callers. Internal detail stays in the log.
enum ApiError {
    Turn(ConversationError),
    Store(DatabaseError),
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Turn(ConversationError::InvalidMessage(reason)) => {
                (StatusCode::BAD_REQUEST, reason)
            }
            // Delivery failure: the provider should redeliver later
            ApiError::Turn(e) => {
                error!(error = %e, "Turn failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Temporarily unavailable, retry later".to_string(),
                )
            }
            ApiError::Store(e) => {
                error!(error = %e, "Store read failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Temporarily unavailable, retry later".to_string(),
                )
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Conversation not found".to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the HTTP routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/messages", post(receive_message))
        .route("/api/simulator/messages", post(simulate_message))
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/log", get(get_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-assist"
    }))
}

/// POST /webhook/messages
///
/// Messaging-provider delivery. A non-2xx response tells the provider to
/// redeliver; redelivery is safe because turns are deduplicated by message id.
async fn receive_message(
    State(state): State<AppState>,
    Json(inbound): Json<InboundMessage>,
) -> Result<Json<TurnResponse>, ApiError> {
    let outcome = state
        .manager
        .handle(inbound.clone())
        .await
        .map_err(ApiError::Turn)?;
    if outcome.duplicate {
        warn!(conversation_id = %inbound.conversation_id, message_id = %inbound.message_id, "Duplicate delivery");
    }
    Ok(Json(TurnResponse::new(&inbound, outcome)))
}

/// POST /api/simulator/messages
async fn simulate_message(
    State(state): State<AppState>,
    Json(msg): Json<SimulatorMessage>,
) -> Result<Json<TurnResponse>, ApiError> {
    let inbound = InboundMessage {
        conversation_id: msg
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("sim:{}", Uuid::new_v4())),
        message_id: Uuid::new_v4().to_string(),
        text: msg.text,
        timestamp: Utc::now(),
    };
    let outcome = state
        .manager
        .handle(inbound.clone())
        .await
        .map_err(ApiError::Turn)?;
    Ok(Json(TurnResponse::new(&inbound, outcome)))
}

/// GET /api/conversations/{id}
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state
        .manager
        .conversation(&id)
        .await
        .map_err(ApiError::Store)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::json!({
        "version": current.version,
        "state": current.value,
    })))
}

/// GET /api/conversations/{id}/log
async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let log = state.manager.message_log(&id).await.map_err(ApiError::Store)?;
    if log.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(log))
}
