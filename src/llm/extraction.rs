//! AI-assisted field extraction.
//!
//! The `Extractor` capability maps free text onto the field schema, returning
//! a candidate value and a confidence per field it can identify. Candidates
//! are raw JSON; typing and validation happen in the field tracker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::schema::{FieldDefinition, FieldType};

/// Confidence assumed when the model returns a value without one.
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// One extracted value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCandidate {
    pub value: serde_json::Value,
    pub confidence: f32,
}

impl ExtractedCandidate {
    pub fn new(value: serde_json::Value, confidence: f32) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Identify values for any of `fields` present in `text`.
    ///
    /// Fields the text says nothing about are simply absent from the map.
    async fn extract(
        &self,
        fields: &[FieldDefinition],
        text: &str,
    ) -> Result<HashMap<String, ExtractedCandidate>, CapabilityError>;
}

/// Extraction through a chat-completion model that answers in JSON.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        fields: &[FieldDefinition],
        text: &str,
    ) -> Result<HashMap<String, ExtractedCandidate>, CapabilityError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are a data extraction assistant. Output only valid JSON."),
            ChatMessage::user(extraction_prompt(fields, text)),
        ])
        .with_max_tokens(512)
        .with_temperature(0.0);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| CapabilityError::ExtractionUnavailable(e.to_string()))?;

        let json_text = extract_json_object(&response.content);
        let parsed: serde_json::Value = serde_json::from_str(&json_text).map_err(|e| {
            tracing::warn!(error = %e, raw = %response.content, "Unparseable extraction reply");
            CapabilityError::ExtractionUnavailable(format!("invalid JSON: {e}"))
        })?;

        let candidates = parse_candidates(fields, &parsed);
        tracing::debug!(count = candidates.len(), "Extraction candidates");
        Ok(candidates)
    }
}

/// Build the extraction prompt listing every field the model may fill.
pub fn extraction_prompt(fields: &[FieldDefinition], text: &str) -> String {
    let field_lines: Vec<String> = fields
        .iter()
        .map(|f| {
            let mut line = format!("- \"{}\" ({}): {}", f.key, type_hint(f), f.label);
            if let Some(desc) = &f.description {
                line.push_str(&format!(" ({desc})"));
            }
            line
        })
        .collect();

    format!(
        "Extract values for these fields from the user's message:\n\
         {}\n\n\
         User message:\n\"\"\"\n{text}\n\"\"\"\n\n\
         Respond with a JSON object keyed by field key. For each field the message \
         mentions, give {{\"value\": <value>, \"confidence\": <0.0-1.0>}}. \
         Normalize numbers to plain numbers (\"200k\" -> 200000) and dates to YYYY-MM-DD. \
         Omit fields that are not mentioned. \
         Respond with ONLY valid JSON, no explanation or markdown formatting.",
        field_lines.join("\n")
    )
}

fn type_hint(field: &FieldDefinition) -> String {
    match field.field_type {
        FieldType::Enum => format!("one of: {}", field.options.join(", ")),
        FieldType::Date => "date, YYYY-MM-DD".to_string(),
        other => other.to_string(),
    }
}

/// Keep entries for known keys with a non-null value. Accepts both
/// `{"value": .., "confidence": ..}` objects and bare values.
fn parse_candidates(
    fields: &[FieldDefinition],
    parsed: &serde_json::Value,
) -> HashMap<String, ExtractedCandidate> {
    let Some(obj) = parsed.as_object() else {
        return HashMap::new();
    };

    obj.iter()
        .filter(|(key, _)| fields.iter().any(|f| &f.key == *key))
        .filter_map(|(key, entry)| {
            let (value, confidence) = match entry {
                serde_json::Value::Object(inner) if inner.contains_key("value") => {
                    let confidence = inner
                        .get("confidence")
                        .and_then(|c| c.as_f64())
                        .map(|c| c as f32)
                        .unwrap_or(DEFAULT_CONFIDENCE);
                    (inner.get("value").cloned()?, confidence)
                }
                other => (other.clone(), DEFAULT_CONFIDENCE),
            };
            if value.is_null() || value.as_str().is_some_and(|s| s.trim().is_empty()) {
                return None;
            }
            Some((key.clone(), ExtractedCandidate::new(value, confidence)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use crate::schema::FieldSchema;

    struct StubLlm {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "down".into(),
                }),
            }
        }
    }

    fn extractor(reply: Result<&str, ()>) -> LlmExtractor {
        LlmExtractor::new(Arc::new(StubLlm {
            reply: reply.map(str::to_string),
        }))
    }

    #[tokio::test]
    async fn parses_fenced_json_and_drops_unknown_keys() {
        let schema = FieldSchema::real_estate();
        let ex = extractor(Ok(
            "```json\n{\"budget\": {\"value\": 200000, \"confidence\": 0.9}, \"shoe_size\": {\"value\": 42, \"confidence\": 1}}\n```",
        ));
        let out = ex.extract(schema.fields(), "around 200k").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["budget"].value, serde_json::json!(200000));
        assert!((out["budget"].confidence - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn null_and_bare_values() {
        let schema = FieldSchema::real_estate();
        let ex = extractor(Ok(r#"{"name": null, "location": "Valencia", "budget": {"value": 5, "confidence": 7}}"#));
        let out = ex.extract(schema.fields(), "Valencia").await.unwrap();
        assert!(!out.contains_key("name"));
        assert_eq!(out["location"].confidence, DEFAULT_CONFIDENCE);
        // Out-of-range confidence is clamped
        assert_eq!(out["budget"].confidence, 1.0);
    }

    #[tokio::test]
    async fn provider_failure_is_extraction_unavailable() {
        let schema = FieldSchema::real_estate();
        let err = extractor(Err(())).extract(schema.fields(), "x").await.unwrap_err();
        assert!(matches!(err, CapabilityError::ExtractionUnavailable(_)));
    }

    #[tokio::test]
    async fn garbage_reply_is_extraction_unavailable() {
        let schema = FieldSchema::real_estate();
        let err = extractor(Ok("I could not find anything"))
            .extract(schema.fields(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::ExtractionUnavailable(_)));
    }

    #[test]
    fn prompt_lists_fields_and_options() {
        let schema = FieldSchema::real_estate();
        let prompt = extraction_prompt(schema.fields(), "I want to rent");
        assert!(prompt.contains("\"operation\" (one of: buy, rent)"));
        assert!(prompt.contains("I want to rent"));
        assert!(prompt.contains("confidence"));
    }
}
