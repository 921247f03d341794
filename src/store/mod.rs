//! Persistence layer: versioned conversation state.

pub mod libsql_backend;
pub mod memory;
mod migrations;
pub mod traits;

#[cfg(test)]
pub(crate) mod conformance;

pub use libsql_backend::LibSqlStore;
pub use memory::InMemoryStore;
pub use traits::{ConversationStore, Versioned};
