//! Workflow entry points: `conveyor run` and `conveyor analyze`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conveyor::agent::{Agent, ClaudeCli};
use conveyor::analyzer::{AnalysisOutcome, AnalysisVerdict, StepwiseAnalyzer, materialize, validate};
use conveyor::orchestrator::{RunOutcome, WorkflowOrchestrator, spawn_signal_handler};
use conveyor::tracker::{self, with_rate_limit_retry};

use super::load_config;

pub async fn cmd_run(
    project_dir: &Path,
    verbose: bool,
    issue: &str,
    workflow: Option<&str>,
) -> Result<i32> {
    let config = load_config(project_dir, verbose)?;
    let agent: Arc<dyn Agent> = Arc::new(ClaudeCli::from_config(&config)?);
    let tracker = tracker::from_config(&config)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let orchestrator = WorkflowOrchestrator::from_config(&config, agent, tracker, cancel);
    let outcome = orchestrator.start(issue, workflow).await?;

    println!();
    match &outcome {
        RunOutcome::Completed { workflow_id } => {
            println!(
                "{} Workflow {} completed",
                style("✓").green().bold(),
                style(workflow_id).bold()
            );
        }
        RunOutcome::Decomposed {
            workflow_id,
            sub_issues,
        } => {
            println!(
                "{} Workflow {} decomposed into {} sub-issues:",
                style("⇉").yellow().bold(),
                style(workflow_id).bold(),
                sub_issues.len()
            );
            for reference in sub_issues {
                println!("    {}", reference);
            }
            println!();
            println!("Run each sub-issue separately once it is triaged.");
        }
        RunOutcome::Failed {
            workflow_id,
            phase,
            cause,
        } => {
            let at = phase.map(|p| format!(" in {}", p)).unwrap_or_default();
            println!(
                "{} Workflow {} failed{}: {}",
                style("✗").red().bold(),
                style(workflow_id).bold(),
                at,
                cause
            );
            println!();
            println!("Inspect it with: conveyor status {}", workflow_id);
        }
    }
    println!();
    Ok(outcome.exit_code())
}

pub async fn cmd_analyze(
    project_dir: &Path,
    verbose: bool,
    issue_ref: &str,
    create_sub_issues: bool,
) -> Result<i32> {
    let config = load_config(project_dir, verbose)?;
    let agent: Arc<dyn Agent> = Arc::new(ClaudeCli::from_config(&config)?);
    let tracker = tracker::from_config(&config)?;
    let retries = config.toml.tracker.rate_limit_retries;

    let issue = with_rate_limit_retry(retries, || tracker.get_issue(issue_ref)).await?;
    let analyzer = StepwiseAnalyzer::new(agent, config.toml.analyzer.min_confidence);

    let (plan, verdict) = match analyzer.analyze(&issue).await? {
        AnalysisOutcome::Atomic(plan) => (plan, AnalysisVerdict::Atomic),
        AnalysisOutcome::Decompose(plan) => (plan, AnalysisVerdict::Decompose),
        AnalysisOutcome::ParseError(reason) => {
            bail!("Analysis response for {} is unusable: {}", issue_ref, reason)
        }
    };
    validate(&plan)?;

    println!("{}", serde_json::to_string_pretty(&plan)?);

    if verdict == AnalysisVerdict::Decompose && create_sub_issues {
        let refs = materialize(&plan, &issue, tracker.as_ref(), retries).await?;
        println!();
        println!("Created {} sub-issues:", refs.len());
        for (spec, reference) in plan.sub_issues.iter().zip(&refs) {
            println!("    {}  {}", style(reference).bold(), spec.title);
        }
    }
    Ok(verdict.exit_code())
}
