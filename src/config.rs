//! Configuration types.
//!
//! Everything is read from `LEAD_ASSIST_*` environment variables; unset or
//! unparsable values fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::conversation::ManagerConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::sinks::EmailSinkConfig;

const PREFIX: &str = "LEAD_ASSIST_";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model name passed to the LLM provider.
    pub model: Option<String>,
    /// HTTP port for the webhook and simulator routes.
    pub port: u16,
    /// SQLite file, or `None` for the in-memory store.
    pub db_path: Option<PathBuf>,
    /// Field schema JSON. The built-in real-estate schema is used when unset.
    pub schema_path: Option<PathBuf>,
    pub knowledge_path: PathBuf,
    /// Minimum extraction confidence accepted without confirmation.
    pub confidence_threshold: f32,
    pub inactivity: Duration,
    pub sweep_interval: Duration,
    pub rag_top_n: usize,
    pub max_log_entries: usize,
    pub store_max_attempts: u32,
    pub extraction_timeout: Duration,
    pub generation_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub store_timeout: Duration,
    pub sink_webhook_url: Option<String>,
    pub notify_email: Option<EmailSinkConfig>,
    /// Directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            port: 8080,
            db_path: Some(PathBuf::from("./data/lead-assist.db")),
            schema_path: None,
            knowledge_path: PathBuf::from("./data/knowledge-base.json"),
            confidence_threshold: 0.7,
            inactivity: Duration::from_secs(24 * 60 * 60), // 24 hours
            sweep_interval: Duration::from_secs(300),      // 5 minutes
            rag_top_n: 4,
            max_log_entries: 200,
            store_max_attempts: 3,
            extraction_timeout: Duration::from_secs(15),
            generation_timeout: Duration::from_secs(30),
            retrieval_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            sink_webhook_url: None,
            notify_email: None,
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.notify_email = EmailSinkConfig::from_env();
        Ok(config)
    }

    /// Build from an arbitrary variable source. Keys are full names,
    /// e.g. `LEAD_ASSIST_PORT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let db_path = match var("DB_PATH") {
            Some(v) if v.eq_ignore_ascii_case("memory") => None,
            Some(v) => Some(PathBuf::from(v)),
            None => defaults.db_path,
        };

        let confidence_threshold =
            parse_or(&var, "CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}CONFIDENCE_THRESHOLD"),
                message: "must be between 0 and 1".to_string(),
            });
        }

        let store_max_attempts: u32 =
            parse_or(&var, "STORE_MAX_ATTEMPTS", defaults.store_max_attempts)?;
        if store_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}STORE_MAX_ATTEMPTS"),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            model: var("MODEL"),
            port: parse_or(&var, "PORT", defaults.port)?,
            db_path,
            schema_path: var("SCHEMA_PATH").map(PathBuf::from),
            knowledge_path: var("KNOWLEDGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_path),
            confidence_threshold,
            inactivity: Duration::from_secs(
                60 * parse_or(&var, "INACTIVITY_MINUTES", defaults.inactivity.as_secs() / 60)?,
            ),
            sweep_interval: secs_or(&var, "SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            rag_top_n: parse_or(&var, "RAG_TOP_N", defaults.rag_top_n)?,
            max_log_entries: parse_or(&var, "MAX_LOG_ENTRIES", defaults.max_log_entries)?,
            store_max_attempts,
            extraction_timeout: secs_or(&var, "EXTRACTION_TIMEOUT_SECS", defaults.extraction_timeout)?,
            generation_timeout: secs_or(&var, "GENERATION_TIMEOUT_SECS", defaults.generation_timeout)?,
            retrieval_timeout: secs_or(&var, "RETRIEVAL_TIMEOUT_SECS", defaults.retrieval_timeout)?,
            store_timeout: secs_or(&var, "STORE_TIMEOUT_SECS", defaults.store_timeout)?,
            sink_webhook_url: var("SINK_WEBHOOK_URL"),
            notify_email: None,
            log_dir: var("LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            inactivity: chrono::Duration::from_std(self.inactivity)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            max_log_entries: self.max_log_entries,
            store_max_attempts: self.store_max_attempts,
            store_timeout: self.store_timeout,
        }
    }

    /// LLM settings from `ANTHROPIC_API_KEY` or, failing that, `OPENAI_API_KEY`.
    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let (backend, api_key) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            (LlmBackend::Anthropic, key)
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            (LlmBackend::OpenAi, key)
        } else {
            return Err(ConfigError::MissingEnvVar(
                "ANTHROPIC_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        };

        let model = self.model.clone().unwrap_or_else(|| match backend {
            LlmBackend::Anthropic => "claude-sonnet-4-20250514".to_string(),
            LlmBackend::OpenAi => "gpt-4o-mini".to_string(),
        });

        Ok(LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{PREFIX}{name}"),
            message: format!("cannot parse {raw:?}"),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(var, name, default.as_secs()).map(Duration::from_secs)
}
