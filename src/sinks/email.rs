//! Email notification sink: sends each completed lead to a sales inbox over
//! SMTP via lettre.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use super::RecordSink;
use crate::error::SinkError;
use crate::schema::FieldValue;

/// SMTP settings for lead notifications.
#[derive(Debug, Clone)]
pub struct EmailSinkConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_addresses: Vec<String>,
}

impl EmailSinkConfig {
    /// Build from `LEAD_ASSIST_NOTIFY_EMAIL_*` variables.
    /// Returns `None` if `LEAD_ASSIST_NOTIFY_EMAIL_SMTP_HOST` is not set (sink disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_FROM").unwrap_or_else(|_| username.clone());

        let to_addresses: Vec<String> = std::env::var("LEAD_ASSIST_NOTIFY_EMAIL_TO")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            to_addresses,
        })
    }
}

pub struct EmailSink {
    config: EmailSinkConfig,
}

impl EmailSink {
    pub fn new(config: EmailSinkConfig) -> Result<Self, SinkError> {
        if config.to_addresses.is_empty() {
            return Err(misconfigured("no recipients configured"));
        }
        Ok(Self { config })
    }

    /// Build the notification message without sending it.
    pub fn build_message(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<Message, SinkError> {
        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| misconfigured(format!("Invalid from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("New lead: {}", subject_name(fields, conversation_id)));
        for to in &self.config.to_addresses {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| misconfigured(format!("Invalid to address {to}: {e}")))?;
            builder = builder.to(mailbox);
        }

        builder
            .body(notification_body(conversation_id, fields))
            .map_err(|e| misconfigured(format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl RecordSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        let email = self.build_message(conversation_id, fields)?;
        let config = self.config.clone();

        // lettre's SmtpTransport is blocking
        let result = tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&config.smtp_host)
                .map_err(|e| format!("SMTP relay error: {e}"))?
                .port(config.smtp_port)
                .credentials(creds)
                .build();
            transport
                .send(&email)
                .map(|_| ())
                .map_err(|e| format!("SMTP send failed: {e}"))
        })
        .await
        .map_err(|e| SinkError::Unreachable {
            name: "email".into(),
            reason: format!("send task failed: {e}"),
        })?;

        result.map_err(|reason| SinkError::Unreachable {
            name: "email".into(),
            reason,
        })?;

        tracing::info!(
            conversation_id,
            recipients = self.config.to_addresses.len(),
            "Lead notification emailed"
        );
        Ok(())
    }
}

fn misconfigured(reason: impl Into<String>) -> SinkError {
    SinkError::Misconfigured {
        name: "email".into(),
        reason: reason.into(),
    }
}

fn subject_name(fields: &BTreeMap<String, FieldValue>, conversation_id: &str) -> String {
    fields
        .get("name")
        .map(|v| v.to_string())
        .unwrap_or_else(|| conversation_id.to_string())
}

/// Plain-text body, one `key: value` line per collected field.
pub fn notification_body(conversation_id: &str, fields: &BTreeMap<String, FieldValue>) -> String {
    let mut body = format!("A new lead finished the intake conversation.\n\nConversation: {conversation_id}\n\n");
    for (key, value) in fields {
        body.push_str(&format!("{key}: {value}\n"));
    }
    body
}
