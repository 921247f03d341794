//! Grounded answers for questions asked mid-conversation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::{DocumentMatch, Retriever};
use crate::error::CapabilityError;
use crate::llm::{ChatMessage, Generator};
use crate::schema::FieldValue;

const SYSTEM_PROMPT: &str = "\
You are a real-estate assistant answering a client's question during a chat.
Answer using only the reference excerpts below. If they do not contain the answer, \
say you will check with an agent. Be concise: 1-3 sentences. Do not ask for personal details.";

/// Outcome of one retrieval-augmented answer. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub matched_documents: Vec<DocumentMatch>,
    pub generated_answer: String,
}

pub struct Responder {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    top_n: usize,
    retrieval_timeout: Duration,
    generation_timeout: Duration,
}

impl Responder {
    pub fn new(retriever: Arc<dyn Retriever>, generator: Arc<dyn Generator>) -> Self {
        Self {
            retriever,
            generator,
            top_n: 4,
            retrieval_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    pub fn with_timeouts(mut self, retrieval: Duration, generation: Duration) -> Self {
        self.retrieval_timeout = retrieval;
        self.generation_timeout = generation;
        self
    }

    /// Retrieve excerpts for `query` and generate an answer grounded in them.
    ///
    /// `collected` is a read-only view of what the user has told us so far.
    pub async fn answer(
        &self,
        query: &str,
        collected: &BTreeMap<String, FieldValue>,
    ) -> Result<RetrievalResult, CapabilityError> {
        let mut matched_documents = timeout(self.retrieval_timeout, self.retriever.search(query))
            .await
            .map_err(|_| {
                CapabilityError::RetrievalUnavailable(format!(
                    "timed out after {:?}",
                    self.retrieval_timeout
                ))
            })??;
        matched_documents.truncate(self.top_n);

        tracing::debug!(
            query,
            matches = matched_documents.len(),
            "Retrieved knowledge excerpts"
        );

        let prompt = build_prompt(query, &matched_documents, collected);
        let generated_answer = timeout(self.generation_timeout, self.generator.generate(prompt))
            .await
            .map_err(|_| {
                CapabilityError::GenerationUnavailable(format!(
                    "timed out after {:?}",
                    self.generation_timeout
                ))
            })??;

        Ok(RetrievalResult {
            query: query.to_string(),
            matched_documents,
            generated_answer,
        })
    }
}

fn build_prompt(
    query: &str,
    matches: &[DocumentMatch],
    collected: &BTreeMap<String, FieldValue>,
) -> Vec<ChatMessage> {
    let excerpts = if matches.is_empty() {
        "(no matching reference material)".to_string()
    } else {
        matches
            .iter()
            .map(|m| format!("[{}] {}", m.document_id, m.excerpt))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut system = format!("{SYSTEM_PROMPT}\n\nReference excerpts:\n{excerpts}");
    if !collected.is_empty() {
        let summary = collected
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        system.push_str(&format!("\n\nWhat the client has told us so far:\n{summary}"));
    }

    vec![ChatMessage::system(system), ChatMessage::user(query)]
}
