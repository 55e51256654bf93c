//! Drives a workflow from issue reference to merged change.
//!
//! `start` runs the analyzer once, then `run_phases` steps through the fixed
//! pipeline, persisting the record after every phase so a crashed run can be
//! resumed by id.

pub mod abort;
pub mod workflow;

pub use abort::spawn_signal_handler;
pub use workflow::WorkflowOrchestrator;

use crate::exit_codes;
use crate::phase::Phase;

/// How a `start` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase ran; the record is archived.
    Completed { workflow_id: String },
    /// Sub-issues were created; nothing was executed.
    Decomposed {
        workflow_id: String,
        sub_issues: Vec<String>,
    },
    /// Analysis was unusable or a blocking phase failed.
    Failed {
        workflow_id: String,
        phase: Option<Phase>,
        cause: String,
    },
}

impl RunOutcome {
    pub fn workflow_id(&self) -> &str {
        match self {
            RunOutcome::Completed { workflow_id }
            | RunOutcome::Decomposed { workflow_id, .. }
            | RunOutcome::Failed { workflow_id, .. } => workflow_id,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { .. } => exit_codes::OK,
            RunOutcome::Decomposed { .. } => exit_codes::DECOMPOSED,
            RunOutcome::Failed { .. } => exit_codes::ERROR,
        }
    }
}
