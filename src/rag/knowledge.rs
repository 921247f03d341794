//! In-memory knowledge base with term-overlap scoring.
//!
//! Loaded once from a JSON file holding free-form documents and/or property
//! listings. Listings are flattened into searchable text.

use std::path::Path;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{DocumentMatch, Retriever};
use crate::error::{CapabilityError, ConfigError};

/// Excerpts are cut to this many characters.
const EXCERPT_CHARS: usize = 400;

/// Terms this short carry no signal ("a", "de", "is").
const MIN_TERM_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertyListing {
    pub id: String,
    pub title: String,
    pub operation: String,
    pub property_type: String,
    pub location: String,
    pub price: Decimal,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub area_m2: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl PropertyListing {
    fn to_document(&self) -> Document {
        let mut content = format!(
            "{} for {} in {}. Price: {}.",
            self.property_type,
            self.operation,
            self.location,
            self.price.normalize()
        );
        if let Some(bedrooms) = self.bedrooms {
            content.push_str(&format!(" Bedrooms: {bedrooms}."));
        }
        if let Some(area) = self.area_m2 {
            content.push_str(&format!(" Area: {area} m2."));
        }
        if !self.description.is_empty() {
            content.push(' ');
            content.push_str(&self.description);
        }
        Document {
            id: self.id.clone(),
            title: self.title.clone(),
            content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    properties: Vec<PropertyListing>,
}

/// Document set searched by counting query terms present in each document.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    documents: Vec<Document>,
    /// Lower-cased `title + content`, parallel to `documents`.
    haystacks: Vec<String>,
    top_n: usize,
}

impl KnowledgeBase {
    pub fn new(documents: Vec<Document>) -> Self {
        let haystacks = documents
            .iter()
            .map(|d| format!("{} {}", d.title, d.content).to_lowercase())
            .collect();
        Self {
            documents,
            haystacks,
            top_n: 4,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: KnowledgeFile =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut documents = file.documents;
        documents.extend(file.properties.iter().map(PropertyListing::to_document));
        Ok(Self::new(documents))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let kb = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), documents = kb.len(), "Loaded knowledge base");
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Score = matched terms / total terms; ties keep file order.
    pub fn rank(&self, query: &str) -> Vec<DocumentMatch> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= MIN_TERM_LEN)
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut results: Vec<DocumentMatch> = self
            .documents
            .iter()
            .zip(&self.haystacks)
            .filter_map(|(doc, haystack)| {
                let matched = terms.iter().filter(|t| haystack.contains(*t)).count();
                (matched > 0).then(|| DocumentMatch {
                    document_id: doc.id.clone(),
                    excerpt: excerpt(doc),
                    score: matched as f32 / terms.len() as f32,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.top_n);
        results
    }
}

fn excerpt(doc: &Document) -> String {
    let text = if doc.title.is_empty() {
        doc.content.clone()
    } else {
        format!("{}: {}", doc.title, doc.content)
    };
    text.chars().take(EXCERPT_CHARS).collect()
}

#[async_trait]
impl Retriever for KnowledgeBase {
    async fn search(&self, query: &str) -> Result<Vec<DocumentMatch>, CapabilityError> {
        Ok(self.rank(query))
    }
}
