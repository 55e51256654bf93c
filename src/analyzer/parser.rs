//! Decoding the analyzer's free-form response.
//!
//! The structured block is looked for in this order:
//!
//! 1. `<decomposition>{...}</decomposition>`
//! 2. a fenced ```` ```json ```` block
//! 3. the first balanced `{...}` in the text
//!
//! The first block found is the answer; a broken block is a parse error
//! rather than a reason to keep looking.

use regex::Regex;
use std::sync::LazyLock;

use super::types::{AnalysisOutcome, Decision, DecompositionPlan};
use crate::util::{extract_fenced_json, extract_json_object};

static DECOMPOSITION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<decomposition>\s*(.*?)\s*</decomposition>").unwrap());

/// Pull the structured block out of the response text.
pub fn extract_block(text: &str) -> Option<String> {
    if let Some(caps) = DECOMPOSITION_TAG.captures(text) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    extract_fenced_json(text).or_else(|| extract_json_object(text))
}

/// Decode a response into Atomic, Decompose or ParseError.
pub fn decode(text: &str) -> AnalysisOutcome {
    let Some(block) = extract_block(text) else {
        return AnalysisOutcome::ParseError("no structured block in response".to_string());
    };
    match serde_json::from_str::<DecompositionPlan>(&block) {
        Ok(plan) => match plan.decision {
            Decision::Atomic => AnalysisOutcome::Atomic(plan),
            Decision::Decompose => AnalysisOutcome::Decompose(plan),
        },
        Err(e) => AnalysisOutcome::ParseError(format!("invalid plan: {}", e)),
    }
}
