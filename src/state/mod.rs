//! Durable per-workflow records.
//!
//! One pretty-printed JSON file per workflow under `.conveyor/workflows/`,
//! replaced atomically on every write; archived records move to
//! `.conveyor/workflows/archive/`.

pub mod store;
pub mod types;

pub use store::{Listing, StateStore, validate_id};
pub use types::{
    Classification, DecompositionRecord, PhaseOutcome, PhaseResult, SCHEMA_VERSION,
    TerminalError, WorkflowState,
};
