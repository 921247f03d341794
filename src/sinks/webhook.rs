//! HTTP webhook sink, e.g. a spreadsheet web-app endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{RecordSink, record_json};
use crate::error::SinkError;
use crate::schema::FieldValue;

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Misconfigured {
                name: "webhook".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RecordSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn submit(
        &self,
        conversation_id: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        let body = serde_json::json!({
            "conversation_id": conversation_id,
            "submitted_at": Utc::now().to_rfc3339(),
            "fields": record_json(fields),
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Unreachable {
                name: "webhook".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                name: "webhook".into(),
                conversation_id: conversation_id.to_string(),
                reason: format!("HTTP {status}: {}", text.chars().take(200).collect::<String>()),
            });
        }

        tracing::info!(conversation_id, url = %self.url, "Lead record posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn serve(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(received): State<Received>, Json(body): Json<serde_json::Value>| async move {
                        received.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), received)
    }

    fn fields() -> BTreeMap<String, FieldValue> {
        BTreeMap::from([("name".to_string(), FieldValue::Text("Maria".into()))])
    }

    #[tokio::test]
    async fn posts_record_json() {
        let (url, received) = serve(StatusCode::OK).await;
        WebhookSink::new(url).unwrap().submit("c1", &fields()).await.unwrap();

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["conversation_id"], "c1");
        assert_eq!(bodies[0]["fields"]["name"], "Maria");
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, _) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        let err = WebhookSink::new(url).unwrap().submit("c1", &fields()).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint() {
        let err = WebhookSink::new("http://127.0.0.1:9/hook")
            .unwrap()
            .submit("c1", &fields())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unreachable { .. }));
    }
}
