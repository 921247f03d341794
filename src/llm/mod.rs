//! Model-backed capabilities for the conversation engine.
//!
//! The engine asks a model for exactly two things: structured field
//! candidates (`Extractor`) and free-text answers to side questions
//! (`Generator`). Both run on one chat-completion model reached through
//! rig-core; `RigAdapter` turns a rig `CompletionModel` into an
//! `LlmProvider`, and `Capabilities` wraps that provider in the two traits
//! the engine consumes. Anything above this module depends only on the
//! traits, so tests swap in scripted implementations.

pub mod extraction;
pub mod generation;
pub mod provider;
mod rig_adapter;

pub use extraction::{ExtractedCandidate, Extractor, LlmExtractor};
pub use generation::{Generator, LlmGenerator};
pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Which hosted model family serves both capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// The extraction and generation capabilities, sharing one provider.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn Extractor>,
    pub generator: Arc<dyn Generator>,
}

impl Capabilities {
    pub fn from_provider(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            extractor: Arc::new(LlmExtractor::new(Arc::clone(&llm))),
            generator: Arc::new(LlmGenerator::new(llm)),
        }
    }

    /// Connect to the configured backend. No request is made here; a bad key
    /// surfaces on the first turn as a capability failure.
    pub fn connect(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self::from_provider(create_provider(config)?))
    }
}

/// Build the raw provider for `config`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let key = config.api_key.expose_secret();
    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
            ))
        }
    };
    tracing::info!(backend = config.backend.as_str(), model = %config.model, "Model client ready");
    Ok(provider)
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.as_str().to_string(),
        reason: format!("client setup: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::schema::FieldSchema;

    /// Records the temperature of every request it serves.
    #[derive(Default)]
    struct Recording {
        temperatures: Mutex<Vec<Option<f32>>>,
    }

    #[async_trait]
    impl LlmProvider for Recording {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.temperatures.lock().unwrap().push(req.temperature);
            Ok(CompletionResponse {
                content: r#"{"name": {"value": "Maria", "confidence": 0.9}}"#.into(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[tokio::test]
    async fn both_capabilities_run_on_the_same_model() {
        let llm = Arc::new(Recording::default());
        let caps = Capabilities::from_provider(llm.clone());
        let schema = FieldSchema::real_estate();

        let found = caps.extractor.extract(schema.fields(), "I'm Maria").await.unwrap();
        assert_eq!(found["name"].value, serde_json::json!("Maria"));
        caps.generator
            .generate(vec![ChatMessage::user("Is there parking?")])
            .await
            .unwrap();

        // Extraction is deterministic, answers are not
        let temps = llm.temperatures.lock().unwrap().clone();
        assert_eq!(temps, vec![Some(0.0), Some(0.3)]);
    }

    #[test]
    fn connect_needs_no_network() {
        for (backend, model) in [
            (LlmBackend::Anthropic, "claude-3-5-haiku-latest"),
            (LlmBackend::OpenAi, "gpt-4o-mini"),
        ] {
            let config = LlmConfig {
                backend,
                api_key: secrecy::SecretString::from("test-key"),
                model: model.to_string(),
            };
            assert_eq!(create_provider(&config).unwrap().model_name(), model);
            assert!(Capabilities::connect(&config).is_ok());
        }
    }
}
