//! Lead Assist: a stateful intake-conversation engine.
//!
//! Guides each user through a configurable set of fields over a messaging
//! channel, answers side questions from a knowledge base, and hands the
//! completed record to downstream sinks exactly once.

pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod logging;
pub mod rag;
pub mod routes;
pub mod schema;
pub mod sinks;
pub mod store;
