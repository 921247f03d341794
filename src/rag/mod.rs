//! Retrieval-augmented answering for ad-hoc user questions.
//!
//! The `Retriever` capability returns scored excerpts; the `Responder`
//! grounds a generated answer in them.

pub mod knowledge;
pub mod responder;

pub use knowledge::KnowledgeBase;
pub use responder::{Responder, RetrievalResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// One scored excerpt returned by a retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMatch {
    pub document_id: String,
    pub excerpt: String,
    pub score: f32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Matches for `query`, best first.
    async fn search(&self, query: &str) -> Result<Vec<DocumentMatch>, CapabilityError>;
}
