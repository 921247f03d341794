//! Field tracker: merges one inbound message into the collected field set.
//!
//! Split in two so a turn can be replayed after a store conflict without
//! calling the extraction capability again: `extract` talks to the
//! capability, `apply` is synchronous and only touches the state it is given.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;

use super::classify::MessageKind;
use super::model::{Clarification, ConversationState, FieldChange, FieldSource};
use crate::error::CapabilityError;
use crate::llm::{ExtractedCandidate, Extractor};
use crate::schema::{FieldSchema, FieldType, FieldValue, ValidationError};

/// Output of one extraction call, or the reason it is unavailable.
pub type Extraction = Result<HashMap<String, ExtractedCandidate>, CapabilityError>;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub key: String,
    pub value: FieldValue,
    pub source: FieldSource,
    pub change: FieldChange,
}

/// The pending field's answer failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub field_key: String,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerOutcome {
    pub updated_fields: Vec<FieldUpdate>,
    /// Required keys without a value, in declaration order.
    pub still_pending: Vec<String>,
    pub rejected: Option<Rejection>,
    /// Low-confidence candidate raised this turn.
    pub clarification: Option<Clarification>,
    /// Field whose clarification the user just turned down.
    pub declined: Option<String>,
    pub next_pending: Option<String>,
    pub extraction_unavailable: bool,
}

pub struct FieldTracker {
    schema: Arc<FieldSchema>,
    extractor: Arc<dyn Extractor>,
    confidence_threshold: f32,
    extraction_timeout: Duration,
}

impl FieldTracker {
    pub fn new(schema: Arc<FieldSchema>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            schema,
            extractor,
            confidence_threshold: 0.7,
            extraction_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_extraction_timeout(mut self, extraction_timeout: Duration) -> Self {
        self.extraction_timeout = extraction_timeout;
        self
    }

    /// Whether this turn needs the extraction capability at all.
    pub fn needs_extraction(&self, state: &ConversationState, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Command(_) | MessageKind::Greeting => false,
            MessageKind::Affirmative | MessageKind::Negative => state.clarification.is_none(),
            MessageKind::Question | MessageKind::Statement => true,
        }
    }

    /// Call the extraction capability once for `text`, bounded by the timeout.
    pub async fn extract(&self, text: &str) -> Extraction {
        let result = timeout(
            self.extraction_timeout,
            self.extractor.extract(self.schema.fields(), text),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CapabilityError::ExtractionUnavailable(format!(
                "timed out after {:?}",
                self.extraction_timeout
            )))
        });

        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Extraction unavailable, using direct validation only");
        }
        result
    }

    /// Extract and apply in one step.
    pub async fn update(
        &self,
        state: &mut ConversationState,
        text: &str,
        kind: MessageKind,
        now: DateTime<Utc>,
    ) -> TrackerOutcome {
        let extraction = if self.needs_extraction(state, kind) {
            self.extract(text).await
        } else {
            Ok(HashMap::new())
        };
        self.apply(state, text, kind, &extraction, now)
    }

    /// Merge one message into `state`. Sets `pending_field_key` and
    /// `clarification`; leaves status to the completion checker.
    pub fn apply(
        &self,
        state: &mut ConversationState,
        text: &str,
        kind: MessageKind,
        extraction: &Extraction,
        now: DateTime<Utc>,
    ) -> TrackerOutcome {
        let today = now.date_naive();
        let empty = HashMap::new();
        let candidates = extraction.as_ref().unwrap_or(&empty);
        let mut outcome = TrackerOutcome {
            extraction_unavailable: extraction.is_err(),
            ..Default::default()
        };

        let pending = state
            .pending_field_key
            .clone()
            .filter(|k| self.schema.get(k).is_some() && !state.is_satisfied(k));

        // 1. Outstanding clarification: yes accepts, no re-asks, anything else
        //    is a fresh answer.
        let clarification_resolved = match state.clarification.take() {
            Some(clarification) => match kind {
                MessageKind::Affirmative => {
                    self.record(
                        state,
                        &mut outcome,
                        &clarification.field_key,
                        clarification.candidate,
                        FieldSource::UserStated,
                        Some(clarification.confidence),
                        now,
                    );
                    true
                }
                MessageKind::Negative => {
                    outcome.declined = Some(clarification.field_key);
                    true
                }
                _ => false,
            },
            None => false,
        };

        if !clarification_resolved && let Some(key) = pending.as_deref() {
            self.answer_pending(state, &mut outcome, key, text, kind, candidates, now);
        }

        // 5. Incidental fields mentioned alongside the answer.
        for def in self.schema.fields() {
            if pending.as_deref() == Some(def.key.as_str()) {
                continue;
            }
            let Some(candidate) = candidates.get(&def.key) else {
                continue;
            };
            if candidate.confidence < self.confidence_threshold {
                continue;
            }
            match self.schema.coerce_candidate(&def.key, &candidate.value, today) {
                Ok(value) => self.record(
                    state,
                    &mut outcome,
                    &def.key,
                    value,
                    FieldSource::Inferred,
                    Some(candidate.confidence),
                    now,
                ),
                Err(e) => {
                    tracing::debug!(field = %def.key, error = %e, "Discarding extraction candidate");
                }
            }
        }

        outcome.still_pending = still_pending(&self.schema, state);
        outcome.next_pending = match &state.clarification {
            Some(c) => Some(c.field_key.clone()),
            None => next_pending(&self.schema, state),
        };
        state.pending_field_key = outcome.next_pending.clone();
        outcome
    }

    /// Steps 2-4 for the pending field: literal parse, then the extraction
    /// candidate, then a rejection.
    #[allow(clippy::too_many_arguments)]
    fn answer_pending(
        &self,
        state: &mut ConversationState,
        outcome: &mut TrackerOutcome,
        key: &str,
        text: &str,
        kind: MessageKind,
        candidates: &HashMap<String, ExtractedCandidate>,
        now: DateTime<Utc>,
    ) {
        let today = now.date_naive();
        let Some(def) = self.schema.get(key) else {
            return;
        };
        let candidate = candidates.get(key);

        // 2. Literal answer. Free-text fields only take plain statements, so
        //    "yes" is never stored as a name.
        let literal_allowed = match def.field_type {
            FieldType::String => kind == MessageKind::Statement,
            _ => kind.is_answer_candidate(),
        };
        let mut direct_error = None;
        if literal_allowed {
            match self.schema.parse_input(key, text, today) {
                Ok(value) => {
                    // A whole sentence parses as text; prefer a confident
                    // extraction that isolates the actual value.
                    let (value, source, confidence) = match candidate {
                        Some(c)
                            if def.field_type == FieldType::String
                                && c.confidence >= self.confidence_threshold =>
                        {
                            match self.schema.coerce_candidate(key, &c.value, today) {
                                Ok(extracted) if extracted != value => {
                                    (extracted, FieldSource::Inferred, Some(c.confidence))
                                }
                                _ => (value, FieldSource::UserStated, None),
                            }
                        }
                        _ => (value, FieldSource::UserStated, None),
                    };
                    self.record(state, outcome, key, value, source, confidence, now);
                    return;
                }
                Err(e) => direct_error = Some(e),
            }
        }

        // 4. Fall back to the extraction candidate for the pending key.
        match candidate {
            Some(c) => match self.schema.coerce_candidate(key, &c.value, today) {
                Ok(value) if c.confidence >= self.confidence_threshold => {
                    self.record(state, outcome, key, value, FieldSource::Inferred, Some(c.confidence), now);
                }
                Ok(value) => {
                    let clarification = Clarification {
                        field_key: key.to_string(),
                        candidate: value,
                        confidence: c.confidence,
                    };
                    state.clarification = Some(clarification.clone());
                    outcome.clarification = Some(clarification);
                }
                Err(e) => {
                    if kind.is_answer_candidate() {
                        outcome.rejected = Some(Rejection {
                            field_key: key.to_string(),
                            error: direct_error.unwrap_or(e),
                        });
                    }
                }
            },
            None => {
                if kind.is_answer_candidate() {
                    outcome.rejected = Some(Rejection {
                        field_key: key.to_string(),
                        error: direct_error.unwrap_or(ValidationError::Empty),
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        state: &mut ConversationState,
        outcome: &mut TrackerOutcome,
        key: &str,
        value: FieldValue,
        source: FieldSource,
        confidence: Option<f32>,
        now: DateTime<Utc>,
    ) {
        let change = state.set_field(key, value.clone(), source, confidence, now);
        if change == FieldChange::Unchanged {
            return;
        }
        let source = state
            .collected_fields
            .get(key)
            .map(|c| c.source)
            .unwrap_or(source);
        tracing::debug!(field = key, ?source, ?change, "Field recorded");
        outcome.updated_fields.push(FieldUpdate {
            key: key.to_string(),
            value,
            source,
            change,
        });
    }
}

/// Required keys without a value, in declaration order.
pub fn still_pending(schema: &FieldSchema, state: &ConversationState) -> Vec<String> {
    schema
        .required()
        .filter(|f| !state.is_satisfied(&f.key))
        .map(|f| f.key.clone())
        .collect()
}

/// First missing required field whose dependencies are all satisfied.
pub fn next_pending(schema: &FieldSchema, state: &ConversationState) -> Option<String> {
    schema
        .required()
        .find(|f| !state.is_satisfied(&f.key) && f.depends_on.iter().all(|d| state.is_satisfied(d)))
        .map(|f| f.key.clone())
}
