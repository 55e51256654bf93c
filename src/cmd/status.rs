//! Workflow and lease inspection: `status`, `abort`, `release`, `leases`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conveyor::agent::{Agent, ClaudeCli};
use conveyor::orchestrator::WorkflowOrchestrator;
use conveyor::phase::{PIPELINE, WorkflowStatus};
use conveyor::resources::ResourceAllocator;
use conveyor::state::{PhaseOutcome, StateStore, WorkflowState};
use conveyor::tracker;

use super::load_config;

pub fn cmd_status(project_dir: &Path, id: Option<&str>) -> Result<()> {
    let config = load_config(project_dir, false)?;
    let store = StateStore::new(config.workflows_dir.clone());

    match id {
        Some(id) => match store.find_any(id)? {
            Some(state) => print_detail(&state),
            None => bail!("Workflow {} not found", id),
        },
        None => {
            let listing = store.list()?;
            println!();
            if listing.records.is_empty() {
                println!("No active workflows.");
            } else {
                println!(
                    "{:<32} {:<12} {:<10} {:<6} Issue",
                    "Workflow", "Status", "Phases", "Slot"
                );
                println!(
                    "{:<32} {:<12} {:<10} {:<6} -----",
                    "--------------------------------", "------------", "----------", "----"
                );
                let allocator = ResourceAllocator::from_config(&config);
                let leases = allocator.leases()?;
                for state in &listing.records {
                    let slot = leases
                        .iter()
                        .find(|l| l.workflow_id == state.id)
                        .map(|l| l.slot.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<32} {} {:<10} {:<6} {}",
                        state.id,
                        status_label(state.status, 12),
                        format!("{}/{}", state.completed_phases.len(), PIPELINE.len()),
                        slot,
                        state.issue_ref
                    );
                }
            }
            for corrupt in &listing.corrupt {
                println!("{} {}", style("warning:").yellow().bold(), corrupt);
            }
            println!();
        }
    }
    Ok(())
}

/// Pads before styling so escape codes don't skew the table columns.
fn status_label(status: WorkflowStatus, width: usize) -> String {
    let text = format!("{:<width$}", status.to_string(), width = width);
    match status {
        WorkflowStatus::Done => style(text).green().to_string(),
        WorkflowStatus::Aborted => style(text).red().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

fn print_detail(state: &WorkflowState) {
    println!();
    println!("Workflow {}", style(&state.id).bold());
    println!("================================");
    println!("Issue:      {} {}", state.issue_ref, state.issue_title);
    println!("Status:     {}", status_label(state.status, 0));
    if let Some(classification) = state.classification {
        println!("Decision:   {:?}", classification);
    }
    if let Some(branch) = &state.branch {
        println!("Branch:     {}", branch);
    }
    if let Some(workspace) = &state.workspace {
        println!("Workspace:  {}", workspace.display());
    }
    if let Some(ports) = state.ports {
        println!("Ports:      {}", ports);
    }
    if let Some(plan) = &state.plan_path {
        println!("Plan:       {}", plan.display());
    }
    println!("Created:    {}", state.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:    {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if state.archived {
        println!("Archived:   yes");
    }

    if let Some(decomposition) = &state.decomposition {
        println!();
        println!("Sub-issues:");
        for (spec, reference) in decomposition
            .plan
            .sub_issues
            .iter()
            .zip(&decomposition.sub_issues)
        {
            println!("  {:<16} {}", reference, spec.title);
        }
    }

    println!();
    println!("{:<10} {:<10} {:<8} Detail", "Phase", "Result", "Retries");
    println!("{:<10} {:<10} {:<8} ------", "-----", "------", "-------");
    for phase in PIPELINE {
        let (label, retries, detail) = match state.result_for(phase) {
            Some(result) => {
                let label = match result.outcome {
                    PhaseOutcome::Success => style(format!("{:<10}", "ok")).green(),
                    PhaseOutcome::Failure => style(format!("{:<10}", "failed")).red(),
                    PhaseOutcome::SkippedNonBlocking => {
                        style(format!("{:<10}", "skipped")).yellow()
                    }
                };
                let detail = if result.is_success() {
                    result.detail.clone().unwrap_or_default()
                } else {
                    result.cause()
                };
                (label, result.retries.to_string(), detail)
            }
            None => (style(format!("{:<10}", "-")).dim(), String::new(), String::new()),
        };
        println!("{:<10} {} {:<8} {}", phase.to_string(), label, retries, detail);
    }

    if let Some(error) = &state.error {
        println!();
        println!("{} {}", style("error:").red().bold(), error);
    }
    println!();
}

pub async fn cmd_abort(project_dir: &Path, verbose: bool, id: &str) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let agent: Arc<dyn Agent> = Arc::new(ClaudeCli::from_config(&config)?);
    let tracker = tracker::from_config(&config)?;
    let orchestrator =
        WorkflowOrchestrator::from_config(&config, agent, tracker, CancellationToken::new());

    let state = orchestrator.abort(id).await?;
    println!(
        "Workflow {} is {}",
        style(&state.id).bold(),
        status_label(state.status, 0)
    );
    if let Some(error) = &state.error {
        println!("  {}", error);
    }
    Ok(())
}

pub fn cmd_release(project_dir: &Path, id: &str) -> Result<()> {
    let config = load_config(project_dir, false)?;
    let allocator = ResourceAllocator::from_config(&config);
    let held = allocator.lease_for(id)?;
    allocator.release(id)?;
    match held {
        Some(lease) => println!("Released slot {} held by {}", lease.slot, id),
        None => println!("{} holds no lease; nothing to release", id),
    }
    Ok(())
}

pub fn cmd_leases(project_dir: &Path) -> Result<()> {
    let config = load_config(project_dir, false)?;
    let allocator = ResourceAllocator::from_config(&config);
    let leases = allocator.leases()?;

    println!();
    println!(
        "{} of {} slots in use",
        leases.len(),
        allocator.capacity()
    );
    if !leases.is_empty() {
        println!();
        println!(
            "{:<6} {:<32} {:<12} {:<20} Workspace",
            "Slot", "Workflow", "Ports", "Acquired"
        );
        println!(
            "{:<6} {:<32} {:<12} {:<20} ---------",
            "----", "--------------------------------", "-----------", "--------------------"
        );
        for lease in &leases {
            println!(
                "{:<6} {:<32} {:<12} {:<20} {}",
                lease.slot,
                lease.workflow_id,
                lease.ports.to_string(),
                lease.acquired_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                lease.workspace.display()
            );
        }
    }
    println!();
    Ok(())
}
