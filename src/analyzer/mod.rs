//! Pre-execution complexity analysis.
//!
//! One agent call classifies an issue as atomic or as a set of dependent
//! sub-issues. The answer is decoded ([`decode`]), checked ([`validate`]) and,
//! for decompositions, turned into tracker issues ([`materialize`]) without
//! further agent calls.

pub mod materialize;
pub mod parser;
pub mod types;
pub mod validate;

pub use materialize::{materialize, materialize_resuming};
pub use parser::decode;
pub use types::{
    AnalysisOutcome, AnalysisRequest, AnalysisVerdict, Decision, DecompositionPlan, SubIssueSpec,
};
pub use validate::{MAX_SUB_ISSUES, MIN_SUB_ISSUES, creation_order, validate};

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::tracker::Issue;

/// Classifies issues with a single agent completion.
pub struct StepwiseAnalyzer {
    agent: Arc<dyn Agent>,
    min_confidence: f64,
}

impl StepwiseAnalyzer {
    pub fn new(agent: Arc<dyn Agent>, min_confidence: f64) -> Self {
        Self {
            agent,
            min_confidence,
        }
    }

    /// Ask the agent once and decode its answer. `Err` means the agent call
    /// itself failed; an unusable answer is `ParseError`.
    pub async fn analyze(&self, issue: &Issue) -> Result<AnalysisOutcome> {
        let request = AnalysisRequest::from(issue);
        let response = self.agent.complete(&analysis_prompt(&request)).await?;
        let outcome = decode(&response);

        match &outcome {
            AnalysisOutcome::Atomic(plan) if plan.confidence < self.min_confidence => {
                warn!(
                    issue = %issue.reference,
                    confidence = plan.confidence,
                    min_confidence = self.min_confidence,
                    "low-confidence atomic classification; proceeding"
                );
            }
            AnalysisOutcome::Atomic(plan) | AnalysisOutcome::Decompose(plan) => {
                info!(
                    issue = %issue.reference,
                    decision = %plan.decision,
                    confidence = plan.confidence,
                    sub_issues = plan.sub_issues.len(),
                    "issue analyzed"
                );
            }
            AnalysisOutcome::ParseError(reason) => {
                warn!(issue = %issue.reference, %reason, "analysis response could not be decoded");
            }
        }
        Ok(outcome)
    }
}

pub fn analysis_prompt(request: &AnalysisRequest) -> String {
    let labels = if request.labels.is_empty() {
        "(none)".to_string()
    } else {
        request.labels.join(", ")
    };
    format!(
        r#"You are triaging an issue before any code is written. Decide whether it can be
implemented as one focused change (atomic) or should be split into {min} to {max}
dependent sub-issues (decompose).

## Issue {reference}
Title: {title}
Labels: {labels}

{body}

## Response format
Reply with a single block:

<decomposition>
{{
  "decision": "atomic" | "decompose",
  "confidence": 0.0-1.0,
  "reasoning": "one or two sentences",
  "sub_issues": [
    {{"title": "...", "body": "...", "labels": ["..."], "depends_on": [0]}}
  ]
}}
</decomposition>

Rules:
- For "atomic", leave sub_issues empty.
- For "decompose", list {min} to {max} sub-issues; depends_on holds 0-based indices of
  other sub-issues in this list and must not form cycles.
"#,
        min = MIN_SUB_ISSUES,
        max = MAX_SUB_ISSUES,
        reference = request.reference,
        title = request.title,
        labels = labels,
        body = request.body.trim(),
    )
}
