//! Conversation engine: state model, field tracking, completion, and the
//! per-message turn loop.

pub mod classify;
pub mod completion;
pub mod locks;
pub mod manager;
pub mod model;
pub mod prompts;
pub mod sweep;
pub mod tracker;

pub use completion::{CompletionCheck, CompletionReason};
pub use locks::ConversationLocks;
pub use manager::{ConversationManager, ManagerConfig, TurnOutcome};
pub use model::{
    CompletionEvent, ConversationState, ConversationStatus, InboundMessage, OutboundMessage,
};
pub use sweep::{InactivitySweep, spawn_sweep_task};
pub use tracker::{FieldTracker, TrackerOutcome};
