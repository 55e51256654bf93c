use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::prompts::repair_prompt;
use crate::agent::Agent;
use crate::phase::Phase;
use crate::resolver::Repairer;
use crate::router::{Failure, ToolReport};
use crate::util::{extract_fenced_json, extract_json_object};

/// Repairs by handing the failure list to the agent inside the workspace.
pub struct AgentRepairer<'a> {
    pub agent: &'a dyn Agent,
    pub workdir: &'a Path,
    pub cancel: &'a CancellationToken,
}

#[async_trait]
impl Repairer for AgentRepairer<'_> {
    async fn repair(&self, phase: Phase, failures: &[Failure]) -> anyhow::Result<()> {
        debug!(phase = %phase, failures = failures.len(), workdir = %self.workdir.display(), "agent repair");
        self.agent
            .execute(self.workdir, &repair_prompt(phase, failures), self.cancel)
            .await
            .map(|_| ())
    }
}

/// Find the `{"failures": [...]}` report in agent output. The last report
/// wins, so examples echoed earlier in the reply are ignored.
pub fn decode_report(text: &str) -> Option<Vec<Failure>> {
    if let Some(fenced) = extract_fenced_json(text)
        && text.matches("```json").count() == 1
        && let Ok(report) = serde_json::from_str::<ToolReport>(&fenced)
    {
        return Some(report.failures);
    }
    text.char_indices()
        .rev()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(i, _)| extract_json_object(&text[i..]))
        .find_map(|candidate| serde_json::from_str::<ToolReport>(&candidate).ok())
        .map(|report| report.failures)
}
