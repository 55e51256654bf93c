//! Executes one phase of a workflow inside its leased workspace.
//!
//! | Phase    | Work                                                   |
//! |----------|--------------------------------------------------------|
//! | Plan     | agent writes `.conveyor/plans/<id>.md` in the workspace |
//! | Build    | agent implements, then the build check under retry     |
//! | Lint     | lint check under retry                                 |
//! | Test     | test check under retry                                 |
//! | Review   | agent reviews the diff under retry                     |
//! | Document | agent updates docs                                     |
//! | Ship     | commit, optionally push and open a pull request        |
//! | Cleanup  | release the lease, archive the record                  |
//!
//! Checks go to the [`ExternalToolRouter`] first; a delegated check is
//! performed by the agent and reported in the same `{"failures": [...]}`
//! shape.

pub mod prompts;
pub mod repair;

pub use repair::{AgentRepairer, decode_report};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::conveyor_config::ShipSection;
use crate::errors::WorkflowError;
use crate::git::{self, GitRepo};
use crate::phase::Phase;
use crate::resolver::{AttemptOutcome, FailureClass, RetryResolver, classify_message};
use crate::resources::{ResourceAllocator, ResourceLease};
use crate::router::{ExternalToolRouter, Failure, RouteOutcome, ToolKind, ToolResult};
use crate::state::{PhaseResult, WorkflowState};
use crate::tracker::{Issue, IssueTracker, NewPullRequest, with_rate_limit_retry};

/// Where the plan artifact lives, relative to the workspace.
pub fn plan_file(workflow_id: &str) -> PathBuf {
    Path::new(".conveyor")
        .join("plans")
        .join(format!("{}.md", workflow_id))
}

/// Knobs the executor needs beyond its collaborators.
#[derive(Debug, Clone, Default)]
pub struct ExecutorSettings {
    pub ship: ShipSection,
    pub rate_limit_retries: u32,
}

pub struct PhaseExecutor {
    agent: Arc<dyn Agent>,
    tracker: Arc<dyn IssueTracker>,
    allocator: Arc<ResourceAllocator>,
    router: ExternalToolRouter,
    resolver: RetryResolver,
    settings: ExecutorSettings,
    cancel: CancellationToken,
}

impl PhaseExecutor {
    pub fn new(
        agent: Arc<dyn Agent>,
        tracker: Arc<dyn IssueTracker>,
        allocator: Arc<ResourceAllocator>,
        router: ExternalToolRouter,
        resolver: RetryResolver,
        settings: ExecutorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            tracker,
            allocator,
            router,
            resolver,
            settings,
            cancel,
        }
    }

    /// Run `phase`. A failed phase is an `Ok` result with a failure outcome;
    /// `Err` is reserved for cancellation.
    pub async fn execute(
        &self,
        phase: Phase,
        state: &mut WorkflowState,
        lease: &ResourceLease,
        issue: &Issue,
    ) -> Result<PhaseResult, WorkflowError> {
        info!(workflow = %state.id, phase = %phase, slot = lease.slot, "executing phase");
        let result = match phase {
            Phase::Plan => self.plan(state, lease, issue).await,
            Phase::Build => self.build(state, lease, issue).await,
            Phase::Lint | Phase::Test => self.check_phase(phase, lease).await,
            Phase::Review => self.review(lease, issue).await,
            Phase::Document => self.document(lease, issue).await,
            Phase::Ship => self.ship(state, lease, issue).await,
            Phase::Cleanup => self.cleanup(state),
        };
        if self.cancel.is_cancelled() && phase != Phase::Cleanup {
            return Err(WorkflowError::Aborted {
                id: state.id.clone(),
            });
        }
        Ok(result)
    }

    async fn plan(&self, state: &mut WorkflowState, lease: &ResourceLease, issue: &Issue) -> PhaseResult {
        let relative = plan_file(&state.id);
        let path = lease.workspace.join(&relative);
        let output = match self
            .agent
            .execute(&lease.workspace, &prompts::plan_prompt(issue, &relative), &self.cancel)
            .await
        {
            Ok(output) => output,
            Err(e) => return PhaseResult::failure(Phase::Plan, format!("planning failed: {:#}", e)),
        };

        // The agent may answer with the plan instead of writing the file
        if !path.exists() {
            let written = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&path, &output));
            if let Err(e) = written {
                return PhaseResult::failure(
                    Phase::Plan,
                    format!("failed to write plan {}: {}", path.display(), e),
                );
            }
        }
        state.plan_path = Some(path.clone());
        PhaseResult::success(Phase::Plan).with_detail(format!("plan at {}", path.display()))
    }

    async fn build(&self, state: &WorkflowState, lease: &ResourceLease, issue: &Issue) -> PhaseResult {
        let prompt = prompts::implement_prompt(issue, state.plan_path.as_deref());
        if let Err(e) = self.agent.execute(&lease.workspace, &prompt, &self.cancel).await {
            return PhaseResult::failure(Phase::Build, format!("implementation failed: {:#}", e));
        }
        self.check_phase(Phase::Build, lease).await
    }

    /// A router check under the retry resolver.
    async fn check_phase(&self, phase: Phase, lease: &ResourceLease) -> PhaseResult {
        let Some(kind) = phase.tool_kind() else {
            return PhaseResult::success(phase);
        };
        let repairer = self.repairer(lease);
        self.resolver
            .resolve(phase, |_| self.check(kind, lease), &repairer)
            .await
            .result
    }

    async fn check(&self, kind: ToolKind, lease: &ResourceLease) -> AttemptOutcome {
        let result = match self.router.run(kind, lease, &self.cancel).await {
            RouteOutcome::Completed(result) => result,
            RouteOutcome::Delegated => self.delegated_check(kind, lease).await,
            RouteOutcome::Aborted => return cancelled(kind.as_str()),
        };
        if self.cancel.is_cancelled() {
            return cancelled(kind.as_str());
        }
        match result {
            ToolResult::Passed => AttemptOutcome::Passed,
            ToolResult::Violations(failures) => AttemptOutcome::Failed {
                failures,
                retryable: true,
            },
            ToolResult::Error { message } => error_outcome(message),
        }
    }

    /// The agent performs the check and reports failures as a checker would.
    async fn delegated_check(&self, kind: ToolKind, lease: &ResourceLease) -> ToolResult {
        let output = match self
            .agent
            .execute(&lease.workspace, &prompts::check_prompt(kind), &self.cancel)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                return ToolResult::Error {
                    message: format!("{} check by agent failed: {:#}", kind, e),
                };
            }
        };
        match decode_report(&output) {
            Some(failures) => {
                let (result, dropped) =
                    crate::router::result::capped_result(failures, self.router.settings().max_failures);
                if dropped > 0 {
                    warn!(tool = %kind, dropped, "failure list capped");
                }
                result
            }
            None => ToolResult::Error {
                message: format!("{} check by agent produced no failure report", kind),
            },
        }
    }

    async fn review(&self, lease: &ResourceLease, issue: &Issue) -> PhaseResult {
        let repairer = self.repairer(lease);
        self.resolver
            .resolve(Phase::Review, |_| self.review_attempt(lease, issue), &repairer)
            .await
            .result
    }

    async fn review_attempt(&self, lease: &ResourceLease, issue: &Issue) -> AttemptOutcome {
        let diff = if GitRepo::is_repository(&lease.workspace) {
            match GitRepo::open(&lease.workspace).and_then(|repo| repo.diff_against_head()) {
                Ok(diff) => diff,
                Err(e) => {
                    return AttemptOutcome::Failed {
                        failures: vec![Failure::message(format!("diff unavailable: {:#}", e))],
                        retryable: false,
                    };
                }
            }
        } else {
            String::from("(workspace is not a git repository; review the files directly)")
        };

        let output = match self
            .agent
            .execute(&lease.workspace, &prompts::review_prompt(issue, &diff), &self.cancel)
            .await
        {
            Ok(output) => output,
            Err(_) if self.cancel.is_cancelled() => return cancelled("review"),
            Err(e) => return error_outcome(format!("review failed: {:#}", e)),
        };
        match decode_report(&output) {
            Some(failures) if failures.is_empty() => AttemptOutcome::Passed,
            Some(failures) => AttemptOutcome::Failed {
                failures,
                retryable: true,
            },
            None => AttemptOutcome::Failed {
                failures: vec![Failure::message("review produced no failure report")],
                retryable: true,
            },
        }
    }

    async fn document(&self, lease: &ResourceLease, issue: &Issue) -> PhaseResult {
        match self
            .agent
            .execute(&lease.workspace, &prompts::document_prompt(issue), &self.cancel)
            .await
        {
            Ok(_) => PhaseResult::success(Phase::Document),
            Err(e) => PhaseResult::failure(Phase::Document, format!("documentation failed: {:#}", e)),
        }
    }

    async fn ship(&self, state: &WorkflowState, lease: &ResourceLease, issue: &Issue) -> PhaseResult {
        if !GitRepo::is_repository(&lease.workspace) {
            return PhaseResult::success(Phase::Ship)
                .with_detail("workspace is not a git repository; nothing committed");
        }
        let message = format!(
            "{}\n\nResolves {}\nWorkflow: {}",
            issue.title, issue.reference, state.id
        );
        let commit = match GitRepo::open(&lease.workspace).and_then(|repo| repo.commit_all(&message)) {
            Ok(commit) => commit,
            Err(e) => return PhaseResult::failure(Phase::Ship, format!("commit failed: {:#}", e)),
        };
        let mut details = vec![match &commit {
            Some(oid) => format!("committed {}", &oid[..oid.len().min(12)]),
            None => "no changes to commit".to_string(),
        }];

        let ship = &self.settings.ship;
        if ship.push {
            if let Err(e) = git::push_branch(&lease.workspace, &ship.remote, &lease.branch).await {
                return PhaseResult::failure(Phase::Ship, format!("{:#}", e));
            }
            details.push(format!("pushed {} to {}", lease.branch, ship.remote));

            if ship.open_pull_request {
                let pull = NewPullRequest {
                    head: lease.branch.clone(),
                    base: None,
                    title: issue.title.clone(),
                    body: format!("Resolves {}\n\nWorkflow `{}`.", issue.reference, state.id),
                };
                match with_rate_limit_retry(self.settings.rate_limit_retries, || {
                    self.tracker.open_pull_request(&pull)
                })
                .await
                {
                    Ok(url) => details.push(format!("pull request {}", url)),
                    Err(e) => {
                        return PhaseResult::failure(
                            Phase::Ship,
                            format!("opening pull request failed: {}", e),
                        );
                    }
                }
            }
        } else if ship.open_pull_request {
            warn!(workflow = %state.id, "ship.open_pull_request needs ship.push; skipping pull request");
        }
        PhaseResult::success(Phase::Ship).with_detail(details.join("; "))
    }

    /// Release the lease and flag the record for the archive. The slot is
    /// cleared even when workspace removal fails.
    fn cleanup(&self, state: &mut WorkflowState) -> PhaseResult {
        let released = self.allocator.release(&state.id);
        state.archived = true;
        match released {
            Ok(()) => PhaseResult::success(Phase::Cleanup),
            Err(e) => PhaseResult::failure(Phase::Cleanup, e.to_string()),
        }
    }

    fn repairer<'a>(&'a self, lease: &'a ResourceLease) -> AgentRepairer<'a> {
        AgentRepairer {
            agent: self.agent.as_ref(),
            workdir: &lease.workspace,
            cancel: &self.cancel,
        }
    }
}

/// A crash or agent error; permission and auth errors end the loop.
fn error_outcome(message: String) -> AttemptOutcome {
    let retryable = classify_message(&message) == FailureClass::Retryable;
    AttemptOutcome::Failed {
        failures: vec![Failure::message(message)],
        retryable,
    }
}

fn cancelled(what: &str) -> AttemptOutcome {
    AttemptOutcome::Failed {
        failures: vec![Failure::message(format!("{} cancelled", what))],
        retryable: false,
    }
}
