//! Error types for Lead Assist.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Field schema errors, raised once at load time.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema declares no fields")]
    Empty,

    #[error("Field key must not be empty")]
    EmptyKey,

    #[error("Duplicate field key: {0}")]
    DuplicateKey(String),

    #[error("Field {field} depends on unknown field {dependency}")]
    UnknownDependency { field: String, dependency: String },

    #[error("Dependency cycle involving field {0}")]
    DependencyCycle(String),

    #[error("Required field {field} depends on optional field {dependency}")]
    RequiredOnOptional { field: String, dependency: String },

    #[error("Enum field {0} declares no options")]
    EmptyOptions(String),

    #[error("Invalid pattern for field {field}: {reason}")]
    InvalidPattern { field: String, reason: String },

    #[error("Failed to parse schema: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Version conflict on conversation {id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether a reload-and-reapply can resolve this error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the opaque external capabilities the engine consumes.
///
/// Every variant degrades to local fallback behaviour; none of them alter
/// conversation state.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Extraction unavailable: {0}")]
    ExtractionUnavailable(String),

    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
}

/// Downstream record sink errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink {name} rejected record for {conversation_id}: {reason}")]
    Rejected {
        name: String,
        conversation_id: String,
        reason: String,
    },

    #[error("Sink {name} unreachable: {reason}")]
    Unreachable { name: String, reason: String },

    #[error("Sink {name} misconfigured: {reason}")]
    Misconfigured { name: String, reason: String },
}

/// Errors that abort a conversation turn.
///
/// These surface to the transport as a delivery failure; the transport is
/// expected to redeliver, which message-id deduplication makes safe.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Store write conflict on {conversation_id} after {attempts} attempts")]
    StoreWriteConflict {
        conversation_id: String,
        attempts: u32,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] DatabaseError),

    #[error("Invalid inbound message: {0}")]
    InvalidMessage(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
