//! Downstream record sinks: where a completed lead goes.
//!
//! The dispatcher calls `RecordSink::submit` exactly once per completion
//! event. Sinks do not retry on their own.

pub mod dispatch;
pub mod email;
pub mod webhook;

pub use dispatch::{Dispatcher, spawn_dispatcher};
pub use email::{EmailSink, EmailSinkConfig};
pub use webhook::WebhookSink;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::schema::FieldValue;

#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError>;
}

/// Flat JSON record: `{"name": "Maria", "budget": 200000}`.
pub fn record_json(fields: &BTreeMap<String, FieldValue>) -> serde_json::Value {
    serde_json::Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Writes the record to the log only. Used when no real sink is configured.
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        tracing::info!(conversation_id, record = %record_json(fields), "Lead record");
        Ok(())
    }
}

/// Submits to every inner sink; succeeds only if all of them do.
///
/// Every sink is attempted even after a failure, so one broken sink does not
/// starve the others of the record.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl RecordSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|s| s.submit(conversation_id, fields)))
                .await;

        let failures: Vec<String> = self
            .sinks
            .iter()
            .zip(results)
            .filter_map(|(sink, result)| {
                result.err().map(|e| {
                    tracing::warn!(sink = sink.name(), conversation_id, error = %e, "Sink failed");
                    format!("{}: {e}", sink.name())
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Rejected {
                name: self.name().to_string(),
                conversation_id: conversation_id.to_string(),
                reason: failures.join("; "),
            })
        }
    }
}
