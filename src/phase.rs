//! The fixed phase pipeline and the workflow status machine.
//!
//! This module provides:
//! - `Phase`, the eight pipeline steps in execution order
//! - `WorkflowStatus`, the persisted state of a run and its legal transitions
//! - helpers to compute which phases remain for a resumed run

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::WorkflowError;
use crate::router::ToolKind;

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Build,
    Lint,
    Test,
    Review,
    Document,
    Ship,
    Cleanup,
}

/// Every phase, in execution order.
pub const PIPELINE: [Phase; 8] = [
    Phase::Plan,
    Phase::Build,
    Phase::Lint,
    Phase::Test,
    Phase::Review,
    Phase::Document,
    Phase::Ship,
    Phase::Cleanup,
];

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Lint => "lint",
            Phase::Test => "test",
            Phase::Review => "review",
            Phase::Document => "document",
            Phase::Ship => "ship",
            Phase::Cleanup => "cleanup",
        }
    }

    /// A blocking phase halts the run when it fails; a non-blocking one is
    /// logged and skipped.
    pub fn is_blocking(self) -> bool {
        !matches!(self, Phase::Document | Phase::Cleanup)
    }

    /// The status a workflow is in while this phase runs.
    pub fn status(self) -> WorkflowStatus {
        match self {
            Phase::Plan => WorkflowStatus::Planning,
            Phase::Build => WorkflowStatus::Building,
            Phase::Lint => WorkflowStatus::Linting,
            Phase::Test => WorkflowStatus::Testing,
            Phase::Review => WorkflowStatus::Reviewing,
            Phase::Document => WorkflowStatus::Documenting,
            Phase::Ship => WorkflowStatus::Shipping,
            Phase::Cleanup => WorkflowStatus::CleaningUp,
        }
    }

    /// The deterministic checker routed out-of-process for this phase, if any.
    pub fn tool_kind(self) -> Option<ToolKind> {
        match self {
            Phase::Build => Some(ToolKind::Build),
            Phase::Lint => Some(ToolKind::Lint),
            Phase::Test => Some(ToolKind::Test),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PIPELINE
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown phase '{}'. Valid values: plan, build, lint, test, review, document, ship, cleanup",
                    s
                )
            })
    }
}

/// Phases that still need to run, given the completed history.
///
/// Completed phases are skipped wherever they appear, so a crashed run
/// resumes at the first phase without a recorded completion.
pub fn remaining_phases(completed: &[Phase]) -> Vec<Phase> {
    PIPELINE
        .iter()
        .copied()
        .filter(|p| !completed.contains(p))
        .collect()
}

/// Persisted status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Created,
    Planning,
    Building,
    Linting,
    Testing,
    Reviewing,
    Documenting,
    Shipping,
    CleaningUp,
    Done,
    Aborted,
}

impl WorkflowStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Planning => 1,
            Self::Building => 2,
            Self::Linting => 3,
            Self::Testing => 4,
            Self::Reviewing => 5,
            Self::Documenting => 6,
            Self::Shipping => 7,
            Self::CleaningUp => 8,
            Self::Done => 9,
            Self::Aborted => 10,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Whether `next` is a legal successor.
    ///
    /// Progress is forward-only. Re-entering the current status is allowed so
    /// a resumed run can restart the phase that was in flight, and skipping
    /// forward is allowed because completed phases are not re-run. `Done` is
    /// only reachable from `CleaningUp`; `Aborted` from any live status.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Aborted => true,
            Self::Done => self == Self::CleaningUp,
            Self::Created => self == Self::Created,
            _ => next.rank() >= self.rank(),
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: WorkflowStatus) -> Result<(), WorkflowError> {
        if !self.can_transition_to(next) {
            return Err(WorkflowError::IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Linting => "linting",
            Self::Testing => "testing",
            Self::Reviewing => "reviewing",
            Self::Documenting => "documenting",
            Self::Shipping => "shipping",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        assert_eq!(PIPELINE.len(), 8);
        assert!(PIPELINE.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(PIPELINE[0], Phase::Plan);
        assert_eq!(PIPELINE[7], Phase::Cleanup);
    }

    #[test]
    fn test_only_document_and_cleanup_are_non_blocking() {
        let non_blocking: Vec<Phase> = PIPELINE
            .iter()
            .copied()
            .filter(|p| !p.is_blocking())
            .collect();
        assert_eq!(non_blocking, vec![Phase::Document, Phase::Cleanup]);
    }

    #[test]
    fn test_tool_kinds() {
        assert_eq!(Phase::Build.tool_kind(), Some(ToolKind::Build));
        assert_eq!(Phase::Lint.tool_kind(), Some(ToolKind::Lint));
        assert_eq!(Phase::Test.tool_kind(), Some(ToolKind::Test));
        assert_eq!(Phase::Review.tool_kind(), None);
        assert_eq!(Phase::Plan.tool_kind(), None);
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("lint".parse::<Phase>().unwrap(), Phase::Lint);
        assert_eq!("Cleanup".parse::<Phase>().unwrap(), Phase::Cleanup);
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Ship).unwrap(), "\"ship\"");
        let parsed: Phase = serde_json::from_str("\"review\"").unwrap();
        assert_eq!(parsed, Phase::Review);
    }

    #[test]
    fn test_remaining_phases_resumes_after_completed() {
        let remaining = remaining_phases(&[Phase::Plan, Phase::Build]);
        assert_eq!(remaining.first(), Some(&Phase::Lint));
        assert_eq!(remaining.len(), 6);

        assert_eq!(remaining_phases(&[]).len(), 8);
        assert!(remaining_phases(&PIPELINE).is_empty());
    }

    #[test]
    fn test_status_happy_path_transitions() {
        let mut status = WorkflowStatus::Created;
        for phase in PIPELINE {
            status.advance(phase.status()).unwrap();
        }
        status.advance(WorkflowStatus::Done).unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn test_status_rejects_backwards_and_terminal_moves() {
        let mut status = WorkflowStatus::Testing;
        assert!(status.advance(WorkflowStatus::Building).is_err());
        assert!(status.advance(WorkflowStatus::Done).is_err());

        let mut done = WorkflowStatus::Done;
        assert!(done.advance(WorkflowStatus::Aborted).is_err());

        let mut aborted = WorkflowStatus::Aborted;
        assert!(aborted.advance(WorkflowStatus::Planning).is_err());
    }

    #[test]
    fn test_status_allows_resume_and_abort() {
        let mut status = WorkflowStatus::Linting;
        status.advance(WorkflowStatus::Linting).unwrap();
        status.advance(WorkflowStatus::Aborted).unwrap();
        assert_eq!(status, WorkflowStatus::Aborted);

        let mut created = WorkflowStatus::Created;
        created.advance(WorkflowStatus::Linting).unwrap();
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            WorkflowStatus::Created,
            WorkflowStatus::CleaningUp,
            WorkflowStatus::Done,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
