use serde::{Deserialize, Serialize};

use super::ToolKind;
use crate::errors::ToolError;

/// One structured finding from a checker or reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub rule_or_message: String,
}

impl Failure {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            rule_or_message: text.into(),
        }
    }

    pub fn at(file: impl Into<String>, line: Option<u32>, text: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            line,
            rule_or_message: text.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: {}", file, line, self.rule_or_message),
            (Some(file), None) => write!(f, "{}: {}", file, self.rule_or_message),
            _ => f.write_str(&self.rule_or_message),
        }
    }
}

/// The stdout contract of a checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolReport {
    pub failures: Vec<Failure>,
}

/// What a checker run concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Passed,
    Violations(Vec<Failure>),
    /// Crash, timeout or malformed output.
    Error { message: String },
}

impl ToolResult {
    pub fn is_passed(&self) -> bool {
        matches!(self, ToolResult::Passed)
    }

    /// Failures to hand to a repair attempt.
    pub fn failures(&self) -> Vec<Failure> {
        match self {
            ToolResult::Passed => Vec::new(),
            ToolResult::Violations(failures) => failures.clone(),
            ToolResult::Error { message } => vec![Failure::message(message.clone())],
        }
    }

    fn from_failures(failures: Vec<Failure>) -> Self {
        if failures.is_empty() {
            ToolResult::Passed
        } else {
            ToolResult::Violations(failures)
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::Error {
            message: err.to_string(),
        }
    }
}

/// Outcome of asking the router to run a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No external checker applies; the caller performs the check itself.
    Delegated,
    Completed(ToolResult),
    /// Cancelled; the subprocess was killed.
    Aborted,
}

/// Parse checker stdout: exactly one JSON object with a `failures` list.
pub fn parse_tool_output(kind: ToolKind, stdout: &str) -> Result<Vec<Failure>, ToolError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ToolError::OutputMalformed {
            kind: kind.to_string(),
            reason: "empty stdout".to_string(),
        });
    }
    let report: ToolReport =
        serde_json::from_str(trimmed).map_err(|e| ToolError::OutputMalformed {
            kind: kind.to_string(),
            reason: e.to_string(),
        })?;
    Ok(report.failures)
}

/// Build a result from parsed failures, keeping at most `max_failures`.
pub(crate) fn capped_result(mut failures: Vec<Failure>, max_failures: usize) -> (ToolResult, usize) {
    let cap = max_failures.max(1);
    let dropped = failures.len().saturating_sub(cap);
    failures.truncate(cap);
    (ToolResult::from_failures(failures), dropped)
}
