use anyhow::anyhow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RunOutcome;
use super::abort::terminate;
use crate::agent::Agent;
use crate::analyzer::{AnalysisOutcome, Decision, StepwiseAnalyzer, materialize_resuming, validate};
use crate::config::Config;
use crate::errors::WorkflowError;
use crate::executor::{ExecutorSettings, PhaseExecutor};
use crate::phase::{Phase, WorkflowStatus, remaining_phases};
use crate::resolver::RetryResolver;
use crate::resources::{ResourceAllocator, ResourceLease};
use crate::router::{ExternalToolRouter, RouterSettings};
use crate::state::{
    Classification, DecompositionRecord, PhaseOutcome, StateStore, WorkflowState, validate_id,
};
use crate::tracker::{Issue, IssueTracker, with_rate_limit_retry};
use crate::util::new_workflow_id;

/// Sequences the phases of one workflow and owns its failure policy.
pub struct WorkflowOrchestrator {
    store: StateStore,
    allocator: Arc<ResourceAllocator>,
    tracker: Arc<dyn IssueTracker>,
    analyzer: StepwiseAnalyzer,
    executor: PhaseExecutor,
    rate_limit_retries: u32,
    cancel: CancellationToken,
}

impl WorkflowOrchestrator {
    pub fn from_config(
        config: &Config,
        agent: Arc<dyn Agent>,
        tracker: Arc<dyn IssueTracker>,
        cancel: CancellationToken,
    ) -> Self {
        let toml = &config.toml;
        let allocator = Arc::new(ResourceAllocator::from_config(config));
        let executor = PhaseExecutor::new(
            agent.clone(),
            tracker.clone(),
            allocator.clone(),
            ExternalToolRouter::new(RouterSettings::from_config(config)),
            RetryResolver::new(toml.retry.max_attempts),
            ExecutorSettings {
                ship: toml.ship.clone(),
                rate_limit_retries: toml.tracker.rate_limit_retries,
            },
            cancel.clone(),
        );

        Self {
            store: StateStore::new(config.workflows_dir.clone()),
            analyzer: StepwiseAnalyzer::new(agent, toml.analyzer.min_confidence),
            rate_limit_retries: toml.tracker.rate_limit_retries,
            allocator,
            tracker,
            executor,
            cancel,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    /// Entry call: create or load the record, classify once, then run.
    ///
    /// With `workflow_id` the stored record is resumed; a record that already
    /// carries a decision is not re-analyzed.
    pub async fn start(
        &self,
        issue_ref: &str,
        workflow_id: Option<&str>,
    ) -> Result<RunOutcome, WorkflowError> {
        let mut state = match workflow_id {
            Some(id) => match self.store.find_any(id)? {
                Some(state) if state.issue_ref != issue_ref => {
                    return Err(anyhow!(
                        "Workflow {} belongs to {}, not {}",
                        id,
                        state.issue_ref,
                        issue_ref
                    )
                    .into());
                }
                Some(state) => {
                    info!(workflow = %id, status = %state.status, completed = state.completed_phases.len(), "resuming workflow");
                    state
                }
                None => {
                    validate_id(id)?;
                    WorkflowState::new(id, issue_ref)
                }
            },
            None => WorkflowState::new(new_workflow_id(issue_ref), issue_ref),
        };

        match state.status {
            WorkflowStatus::Done => {
                info!(workflow = %state.id, "workflow already completed");
                return Ok(RunOutcome::Completed {
                    workflow_id: state.id,
                });
            }
            WorkflowStatus::Aborted => {
                let (phase, cause) = match &state.error {
                    Some(error) => (error.phase, error.cause.clone()),
                    None => (None, "aborted".to_string()),
                };
                return Ok(RunOutcome::Failed {
                    workflow_id: state.id,
                    phase,
                    cause: format!("{} (workflow is aborted; start a new one)", cause),
                });
            }
            _ => {}
        }
        if state.classification == Some(Classification::Decompose) {
            let sub_issues = state
                .decomposition
                .as_ref()
                .map(|d| d.sub_issues.clone())
                .unwrap_or_default();
            return Ok(RunOutcome::Decomposed {
                workflow_id: state.id,
                sub_issues,
            });
        }

        let issue = with_rate_limit_retry(self.rate_limit_retries, || {
            self.tracker.get_issue(issue_ref)
        })
        .await?;
        state.issue_title = issue.title.clone();
        state.owner_pid = Some(std::process::id());
        self.store.put(&mut state)?;

        if state.classification.is_none() {
            // An interrupted decomposition keeps its plan; only the missing
            // sub-issues are created
            if state.decomposition.is_some() {
                return self.decompose(&mut state, &issue).await;
            }
            if let Some(outcome) = self.classify(&mut state, &issue).await? {
                return Ok(outcome);
            }
        }
        self.run_phases(&mut state, &issue).await
    }

    /// Run the analyzer and act on its verdict. `None` means atomic: go on
    /// to the pipeline.
    async fn classify(
        &self,
        state: &mut WorkflowState,
        issue: &Issue,
    ) -> Result<Option<RunOutcome>, WorkflowError> {
        let plan = match self.analyzer.analyze(issue).await {
            Ok(AnalysisOutcome::Atomic(plan) | AnalysisOutcome::Decompose(plan)) => plan,
            Ok(AnalysisOutcome::ParseError(reason)) => {
                return self
                    .reject(state, format!("analysis response unusable: {}", reason))
                    .await
                    .map(Some);
            }
            Err(e) => {
                return self
                    .reject(state, format!("analysis failed: {:#}", e))
                    .await
                    .map(Some);
            }
        };
        if let Err(e) = validate(&plan) {
            return self
                .reject(state, format!("invalid decomposition plan: {}", e))
                .await
                .map(Some);
        }

        match plan.decision {
            Decision::Atomic => {
                state.classification = Some(Classification::Atomic);
                self.store.put(state)?;
                Ok(None)
            }
            Decision::Decompose => {
                state.decomposition = Some(DecompositionRecord::new(plan));
                self.store.put(state)?;
                self.decompose(state, issue).await.map(Some)
            }
        }
    }

    /// Create the recorded plan's sub-issues, persisting each reference as
    /// it is made. A failure aborts the record and names what already exists.
    async fn decompose(
        &self,
        state: &mut WorkflowState,
        issue: &Issue,
    ) -> Result<RunOutcome, WorkflowError> {
        let Some(record) = state.decomposition.clone() else {
            return self.reject(state, "no decomposition plan recorded".to_string()).await;
        };
        let store = &self.store;
        let materialized = materialize_resuming(
            &record.plan,
            issue,
            self.tracker.as_ref(),
            self.rate_limit_retries,
            record.created,
            |created| {
                if let Some(record) = state.decomposition.as_mut() {
                    record.created = created.to_vec();
                }
                Ok(store.put(state)?)
            },
        )
        .await;

        let sub_issues = match materialized {
            Ok(sub_issues) => sub_issues,
            Err(e) => {
                let made: Vec<String> = state
                    .decomposition
                    .iter()
                    .flat_map(|d| d.created.iter().flatten().cloned())
                    .collect();
                let mut cause = format!("creating sub-issues failed: {}", e);
                if !made.is_empty() {
                    cause.push_str(&format!(" (already created: {})", made.join(", ")));
                }
                return self.reject(state, cause).await;
            }
        };

        info!(workflow = %state.id, count = sub_issues.len(), "issue decomposed; halting for triage");
        state.classification = Some(Classification::Decompose);
        if let Some(record) = state.decomposition.as_mut() {
            record.sub_issues = sub_issues.clone();
        }
        state.archived = true;
        self.store.put(state)?;
        Ok(RunOutcome::Decomposed {
            workflow_id: state.id.clone(),
            sub_issues,
        })
    }

    /// Triage produced nothing actionable: abort before any phase ran.
    async fn reject(
        &self,
        state: &mut WorkflowState,
        cause: String,
    ) -> Result<RunOutcome, WorkflowError> {
        warn!(workflow = %state.id, %cause, "triage failed");
        state.abort_with(None, cause.clone());
        self.store.put(state)?;
        self.notify(
            &state.issue_ref,
            &format!("Conveyor could not triage this issue (workflow `{}`): {}", state.id, cause),
        )
        .await;
        Ok(RunOutcome::Failed {
            workflow_id: state.id.clone(),
            phase: None,
            cause,
        })
    }

    /// Step through every phase not yet completed, persisting after each.
    pub async fn run_phases(
        &self,
        state: &mut WorkflowState,
        issue: &Issue,
    ) -> Result<RunOutcome, WorkflowError> {
        let remaining = remaining_phases(&state.completed_phases);
        let Some(&first) = remaining.first() else {
            return self.finish(state).await;
        };
        if self.cancel.is_cancelled() {
            return self.cancelled(state, Some(first)).await;
        }

        let branch = state
            .branch
            .clone()
            .unwrap_or_else(|| format!("conveyor/{}", state.id));
        let lease = self.allocator.acquire(&state.id, &branch)?;
        info!(workflow = %state.id, slot = lease.slot, ports = %lease.ports, workspace = %lease.workspace.display(), "lease acquired");
        state.branch = Some(branch);
        state.workspace = Some(lease.workspace.clone());
        state.ports = Some(lease.ports);

        // From here on every error aborts the record and frees the slot
        match self.drive(state, issue, &lease, &remaining).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ WorkflowError::Aborted { .. }) => Err(e),
            // Already aborted and reported; only the write failed
            Err(e) if state.is_terminal() => Err(e),
            Err(e) => {
                let phase = state.current_phase().unwrap_or(first);
                self.fail(state, phase, e.to_string()).await
            }
        }
    }

    async fn drive(
        &self,
        state: &mut WorkflowState,
        issue: &Issue,
        lease: &ResourceLease,
        remaining: &[Phase],
    ) -> Result<RunOutcome, WorkflowError> {
        self.store.put(state)?;
        let greeting = if state.completed_phases.is_empty() {
            format!("Conveyor started workflow `{}` on branch `{}`.", state.id, lease.branch)
        } else {
            format!("Conveyor resumed workflow `{}` at the {} phase.", state.id, remaining[0])
        };
        self.notify(&state.issue_ref, &greeting).await;

        for &phase in remaining {
            if self.cancel.is_cancelled() {
                return self.cancelled(state, Some(phase)).await;
            }
            state.transition(phase.status())?;
            self.store.put(state)?;

            let mut result = match self.executor.execute(phase, state, lease, issue).await {
                Ok(result) => result,
                Err(WorkflowError::Aborted { .. }) => return self.cancelled(state, Some(phase)).await,
                Err(e) => return Err(e),
            };

            if result.is_success() {
                info!(workflow = %state.id, phase = %phase, retries = result.retries, "phase complete");
            } else if !phase.is_blocking() {
                warn!(workflow = %state.id, phase = %phase, cause = %result.cause(), "non-blocking phase failed; continuing");
                result.outcome = PhaseOutcome::SkippedNonBlocking;
            } else {
                let cause = result.cause();
                state.record_result(result);
                return self.fail(state, phase, cause).await;
            }
            state.record_result(result);
            state.mark_completed(phase);
            self.store.put(state)?;
        }

        self.finish(state).await
    }

    async fn finish(&self, state: &mut WorkflowState) -> Result<RunOutcome, WorkflowError> {
        state.transition(WorkflowStatus::Done)?;
        self.store.put(state)?;
        info!(workflow = %state.id, "workflow complete");

        let mut message = format!("Conveyor workflow `{}` completed.", state.id);
        if let Some(detail) = state.result_for(Phase::Ship).and_then(|r| r.detail.as_deref()) {
            message.push_str(&format!("\n\nShip: {}", detail));
        }
        self.notify(&state.issue_ref, &message).await;
        Ok(RunOutcome::Completed {
            workflow_id: state.id.clone(),
        })
    }

    /// A blocking phase failed: abort, release, report. The tracker hears
    /// about it even when the record cannot be written.
    async fn fail(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        cause: String,
    ) -> Result<RunOutcome, WorkflowError> {
        warn!(workflow = %state.id, phase = %phase, %cause, "blocking phase failed; aborting");
        state.abort_with(Some(phase), cause.clone());
        self.release_quietly(&state.id);
        let stored = self.store.put(state);
        self.notify(
            &state.issue_ref,
            &format!(
                "Conveyor workflow `{}` failed in the {} phase: {}",
                state.id, phase, cause
            ),
        )
        .await;
        stored?;
        Ok(RunOutcome::Failed {
            workflow_id: state.id.clone(),
            phase: Some(phase),
            cause,
        })
    }

    /// The run was cancelled by a signal. An operator abort may already have
    /// written the terminal record; it is kept as written.
    async fn cancelled(
        &self,
        state: &mut WorkflowState,
        phase: Option<Phase>,
    ) -> Result<RunOutcome, WorkflowError> {
        warn!(workflow = %state.id, phase = ?phase, "workflow cancelled");
        self.release_quietly(&state.id);
        match self.store.find(&state.id) {
            Ok(Some(stored)) if stored.is_terminal() => *state = stored,
            _ => {
                state.abort_with(phase, "cancelled by signal");
                self.store.put(state)?;
                self.notify(
                    &state.issue_ref,
                    &format!("Conveyor workflow `{}` was cancelled.", state.id),
                )
                .await;
            }
        }
        Err(WorkflowError::Aborted {
            id: state.id.clone(),
        })
    }

    /// Operator abort, usually from another process: mark Aborted, signal the
    /// owner, release the lease unconditionally. A missing or unreadable
    /// record is reported after the release.
    pub async fn abort(&self, id: &str) -> Result<WorkflowState, WorkflowError> {
        let marked = self.mark_aborted(id).await;
        let released = self.allocator.release(id);
        match marked {
            Ok(state) => {
                released?;
                Ok(state)
            }
            Err(e) => {
                match released {
                    Ok(()) => info!(workflow = %id, error = %e, "lease released; record unusable"),
                    Err(release) => warn!(workflow = %id, error = %release, "failed to release lease"),
                }
                Err(e)
            }
        }
    }

    async fn mark_aborted(&self, id: &str) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.store.get(id)?;
        if !state.is_terminal() {
            let phase = state.current_phase();
            state.abort_with(phase, "aborted by operator");
            self.store.put(&mut state)?;
            self.notify(
                &state.issue_ref,
                &format!("Conveyor workflow `{}` was aborted by an operator.", state.id),
            )
            .await;
        }
        if let Some(pid) = state.owner_pid
            && terminate(pid)
        {
            info!(workflow = %id, pid, "signalled workflow owner");
        }
        Ok(state)
    }

    fn release_quietly(&self, id: &str) {
        if let Err(e) = self.allocator.release(id) {
            warn!(workflow = %id, error = %e, "failed to release lease");
        }
    }

    /// Tracker comments are best effort; failures are logged.
    async fn notify(&self, reference: &str, body: &str) {
        let posted = with_rate_limit_retry(self.rate_limit_retries, || {
            self.tracker.comment(reference, body)
        })
        .await;
        match posted {
            Ok(()) => debug!(issue = %reference, "tracker updated"),
            Err(e) => warn!(issue = %reference, error = %e, "failed to update issue tracker"),
        }
    }
}
