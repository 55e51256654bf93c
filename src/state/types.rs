use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analyzer::DecompositionPlan;
use crate::errors::WorkflowError;
use crate::phase::{PIPELINE, Phase, WorkflowStatus};
use crate::resolver::ResolutionOutcome;
use crate::resources::PortPair;
use crate::router::Failure;

/// Current on-disk record version. Evolution is additive: new fields get a
/// serde default, unknown fields are ignored.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    1
}

/// The analyzer's decision for the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Atomic,
    Decompose,
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failure,
    SkippedNonBlocking,
}

/// Result of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    /// Structured failures left after the last attempt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
    /// Failed attempts consumed
    #[serde(default)]
    pub retries: u32,
    /// Set for phases that ran under the retry resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionOutcome>,
    /// Free-form note (e.g. why a non-blocking phase was skipped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn success(phase: Phase) -> Self {
        Self {
            phase,
            outcome: PhaseOutcome::Success,
            failures: Vec::new(),
            retries: 0,
            resolution: None,
            detail: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(phase: Phase, detail: impl Into<String>) -> Self {
        Self {
            outcome: PhaseOutcome::Failure,
            detail: Some(detail.into()),
            ..Self::success(phase)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PhaseOutcome::Success
    }

    /// One-line cause for reports, preferring the first structured failure.
    pub fn cause(&self) -> String {
        if let Some(detail) = &self.detail {
            return detail.clone();
        }
        match self.failures.first() {
            Some(first) if self.failures.len() > 1 => {
                format!("{} (+{} more)", first, self.failures.len() - 1)
            }
            Some(first) => first.to_string(),
            None => format!("{} failed", self.phase),
        }
    }
}

/// The phase and cause that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub cause: String,
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{}: {}", phase, self.cause),
            None => f.write_str(&self.cause),
        }
    }
}

/// A validated decomposition and the sub-issues it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionRecord {
    pub plan: DecompositionPlan,
    /// Final references, in plan order, once every sub-issue exists
    #[serde(default)]
    pub sub_issues: Vec<String>,
    /// Progress while materializing, indexed like `plan.sub_issues`
    #[serde(default)]
    pub created: Vec<Option<String>>,
}

impl DecompositionRecord {
    pub fn new(plan: DecompositionPlan) -> Self {
        Self {
            plan,
            sub_issues: Vec::new(),
            created: Vec::new(),
        }
    }
}

/// The persisted record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub issue_ref: String,
    #[serde(default)]
    pub issue_title: String,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub plan_path: Option<PathBuf>,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub ports: Option<PortPair>,
    /// Append-only, in completion order
    #[serde(default)]
    pub completed_phases: Vec<Phase>,
    #[serde(default)]
    pub results: Vec<PhaseResult>,
    #[serde(default)]
    pub decomposition: Option<DecompositionRecord>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<TerminalError>,
    /// Pid of the orchestrator process currently driving the record
    #[serde(default)]
    pub owner_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl WorkflowState {
    pub fn new(id: impl Into<String>, issue_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            id: id.into(),
            issue_ref: issue_ref.into(),
            issue_title: String::new(),
            classification: None,
            branch: None,
            plan_path: None,
            workspace: None,
            ports: None,
            completed_phases: Vec::new(),
            results: Vec::new(),
            decomposition: None,
            status: WorkflowStatus::Created,
            error: None,
            owner_pid: None,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    pub fn is_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Record a phase as complete. Re-marking is a no-op.
    pub fn mark_completed(&mut self, phase: Phase) {
        if !self.is_completed(phase) {
            self.completed_phases.push(phase);
        }
    }

    /// Store a phase result, replacing any earlier result for the same phase.
    pub fn record_result(&mut self, result: PhaseResult) {
        match self.results.iter_mut().find(|r| r.phase == result.phase) {
            Some(existing) => *existing = result,
            None => self.results.push(result),
        }
    }

    pub fn result_for(&self, phase: Phase) -> Option<&PhaseResult> {
        self.results.iter().find(|r| r.phase == phase)
    }

    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), WorkflowError> {
        self.status.advance(next)
    }

    /// Move to Aborted with a terminal error. A terminal record is left as is.
    pub fn abort_with(&mut self, phase: Option<Phase>, cause: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = WorkflowStatus::Aborted;
        self.error = Some(TerminalError {
            phase,
            cause: cause.into(),
        });
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The phase the record's status says is running.
    pub fn current_phase(&self) -> Option<Phase> {
        PIPELINE.iter().copied().find(|p| p.status() == self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let state = WorkflowState::new("wf-1", "local#1");
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.status, WorkflowStatus::Created);
        assert!(state.completed_phases.is_empty());
        assert!(!state.archived);
    }

    #[test]
    fn test_mark_completed_is_append_only() {
        let mut state = WorkflowState::new("wf-1", "local#1");
        state.mark_completed(Phase::Plan);
        state.mark_completed(Phase::Build);
        state.mark_completed(Phase::Plan);
        assert_eq!(state.completed_phases, vec![Phase::Plan, Phase::Build]);
    }

    #[test]
    fn test_record_result_replaces_same_phase() {
        let mut state = WorkflowState::new("wf-1", "local#1");
        state.record_result(PhaseResult::failure(Phase::Lint, "2 violations"));
        state.record_result(PhaseResult::success(Phase::Lint));
        assert_eq!(state.results.len(), 1);
        assert!(state.result_for(Phase::Lint).unwrap().is_success());
    }

    #[test]
    fn test_abort_with_sets_terminal_error_once() {
        let mut state = WorkflowState::new("wf-1", "local#1");
        state.transition(WorkflowStatus::Linting).unwrap();
        state.abort_with(Some(Phase::Lint), "unused import");
        assert_eq!(state.status, WorkflowStatus::Aborted);
        assert_eq!(
            state.error.as_ref().unwrap().to_string(),
            "lint: unused import"
        );

        state.abort_with(None, "operator abort");
        assert_eq!(state.error.unwrap().cause, "unused import");
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{
            "id": "wf-old",
            "issue_ref": "local#9",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let state: WorkflowState = serde_json::from_str(json).unwrap();
        assert_eq!(state.schema_version, 1);
        assert_eq!(state.status, WorkflowStatus::Created);
        assert!(state.results.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "schema_version": 2,
            "id": "wf-new",
            "issue_ref": "local#9",
            "future_field": {"nested": true},
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let state: WorkflowState = serde_json::from_str(json).unwrap();
        assert_eq!(state.schema_version, 2);
        assert_eq!(state.id, "wf-new");
    }

    #[test]
    fn test_phase_result_cause_prefers_detail_then_failures() {
        let mut result = PhaseResult::success(Phase::Test);
        result.outcome = PhaseOutcome::Failure;
        result.failures = vec![
            Failure::message("test_login failed"),
            Failure::message("test_logout failed"),
        ];
        assert_eq!(result.cause(), "test_login failed (+1 more)");

        let result = result.with_detail("timed out");
        assert_eq!(result.cause(), "timed out");
    }
}
