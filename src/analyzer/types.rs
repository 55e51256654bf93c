use serde::{Deserialize, Serialize};

/// Whether an issue is handled in one run or split first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Atomic,
    Decompose,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Atomic => write!(f, "atomic"),
            Decision::Decompose => write!(f, "decompose"),
        }
    }
}

/// One proposed sub-issue. `depends_on` holds 0-based indices into the
/// same plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubIssueSpec {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// The analyzer's structured answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub decision: Decision,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub sub_issues: Vec<SubIssueSpec>,
}

/// The decoded response, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Atomic(DecompositionPlan),
    Decompose(DecompositionPlan),
    ParseError(String),
}

/// What the entry call does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisVerdict {
    /// Proceed to the phase pipeline.
    Atomic,
    /// Sub-issues were created; halt for triage.
    Decompose,
    /// Unparseable or invalid response, or a collaborator failed.
    Error,
}

impl AnalysisVerdict {
    pub fn exit_code(self) -> i32 {
        match self {
            AnalysisVerdict::Atomic => crate::exit_codes::OK,
            AnalysisVerdict::Decompose => crate::exit_codes::DECOMPOSED,
            AnalysisVerdict::Error => crate::exit_codes::ERROR,
        }
    }
}

/// Full issue context handed to the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRequest {
    pub reference: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

impl From<&crate::tracker::Issue> for AnalysisRequest {
    fn from(issue: &crate::tracker::Issue) -> Self {
        Self {
            reference: issue.reference.clone(),
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(AnalysisVerdict::Atomic.exit_code(), 0);
        assert_eq!(AnalysisVerdict::Decompose.exit_code(), 10);
        assert_eq!(AnalysisVerdict::Error.exit_code(), 1);
    }

    #[test]
    fn test_plan_defaults_optional_fields() {
        let plan: DecompositionPlan =
            serde_json::from_str(r#"{"decision": "atomic", "confidence": 0.9}"#).unwrap();
        assert_eq!(plan.decision, Decision::Atomic);
        assert!(plan.reasoning.is_empty());
        assert!(plan.sub_issues.is_empty());
    }
}
