//! Free-text answer generation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a reply for a fully assembled prompt.
    async fn generate(&self, prompt: Vec<ChatMessage>) -> Result<String, CapabilityError>;
}

pub struct LlmGenerator {
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl LlmGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            max_tokens: 400,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, prompt: Vec<ChatMessage>) -> Result<String, CapabilityError> {
        let request = CompletionRequest::new(prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.3);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| CapabilityError::GenerationUnavailable(e.to_string()))?;

        let text = response.content.trim();
        if text.is_empty() {
            return Err(CapabilityError::GenerationUnavailable(
                "empty completion".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, FinishReason};

    struct EchoLlm;

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResponse {
                content: format!("  {last}  "),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[tokio::test]
    async fn returns_trimmed_text() {
        let generator = LlmGenerator::new(Arc::new(EchoLlm));
        let out = generator
            .generate(vec![ChatMessage::user("We cover Valencia.")])
            .await
            .unwrap();
        assert_eq!(out, "We cover Valencia.");
    }

    #[tokio::test]
    async fn empty_completion_is_unavailable() {
        let generator = LlmGenerator::new(Arc::new(EchoLlm));
        let err = generator.generate(vec![ChatMessage::user("   ")]).await.unwrap_err();
        assert!(matches!(err, CapabilityError::GenerationUnavailable(_)));
    }
}
