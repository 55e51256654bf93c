//! Bounded retry-with-repair around one phase attempt.
//!
//! ```text
//! attempt(1) -> failed -> repair(failures) -> attempt(2) -> ... -> attempt(max)
//! ```
//!
//! The repairer only ever sees the structured failure list of the attempt
//! that just failed. The loop ends in exactly one of three outcomes:
//! succeeded, exhausted, or non-retryable.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::phase::Phase;
use crate::router::Failure;
use crate::state::{PhaseOutcome, PhaseResult};

static NON_RETRYABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(permission denied|unauthori[sz]ed|authentication (failed|required)|forbidden|access denied|operation not permitted|invalid api key|bad credentials)",
    )
    .unwrap()
});

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    Failed {
        failures: Vec<Failure>,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
}

/// Permission and authentication errors cannot be repaired by editing code.
///
/// Only for crash and agent error text. A checker's violations are never
/// classified: a test named after a 401 is still an ordinary failure.
pub fn classify_message(message: &str) -> FailureClass {
    if NON_RETRYABLE.is_match(message) {
        FailureClass::NonRetryable
    } else {
        FailureClass::Retryable
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Succeeded,
    Exhausted,
    NonRetryable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub result: PhaseResult,
}

impl Resolution {
    pub fn succeeded(&self) -> bool {
        self.outcome == ResolutionOutcome::Succeeded
    }
}

/// Attempts a fix between two attempts.
#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, phase: Phase, failures: &[Failure]) -> anyhow::Result<()>;
}

pub struct RetryResolver {
    max_attempts: u32,
}

impl RetryResolver {
    /// `max_attempts` of 0 is treated as 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt` (1-based attempt number) until it passes, the budget
    /// runs out, or a failure cannot be retried. `retries` in the result
    /// counts failed attempts.
    pub async fn resolve<F, Fut, R>(&self, phase: Phase, mut attempt: F, repairer: &R) -> Resolution
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
        R: Repairer + ?Sized,
    {
        let mut retries = 0u32;
        let mut attempt_no = 1u32;

        loop {
            debug!(phase = %phase, attempt = attempt_no, max = self.max_attempts, "phase attempt");
            let (failures, retryable) = match attempt(attempt_no).await {
                AttemptOutcome::Passed => {
                    info!(phase = %phase, attempt = attempt_no, retries, "phase attempt passed");
                    return finish(phase, ResolutionOutcome::Succeeded, Vec::new(), retries, None);
                }
                AttemptOutcome::Failed {
                    failures,
                    retryable,
                } => (failures, retryable),
            };
            retries += 1;

            if !retryable {
                warn!(phase = %phase, attempt = attempt_no, "non-retryable failure");
                return finish(phase, ResolutionOutcome::NonRetryable, failures, retries, None);
            }
            if attempt_no >= self.max_attempts {
                warn!(phase = %phase, attempts = attempt_no, remaining = failures.len(), "retries exhausted");
                return finish(phase, ResolutionOutcome::Exhausted, failures, retries, None);
            }

            info!(phase = %phase, attempt = attempt_no, failures = failures.len(), "repairing");
            if let Err(e) = repairer.repair(phase, &failures).await {
                let message = format!("{:#}", e);
                if classify_message(&message) == FailureClass::NonRetryable {
                    warn!(phase = %phase, error = %message, "repair failed; not retryable");
                    return finish(
                        phase,
                        ResolutionOutcome::NonRetryable,
                        failures,
                        retries,
                        Some(format!("repair failed: {}", message)),
                    );
                }
                warn!(phase = %phase, error = %message, "repair failed; retrying anyway");
            }
            attempt_no += 1;
        }
    }
}

fn finish(
    phase: Phase,
    outcome: ResolutionOutcome,
    failures: Vec<Failure>,
    retries: u32,
    detail: Option<String>,
) -> Resolution {
    let mut result = PhaseResult::success(phase);
    result.outcome = match outcome {
        ResolutionOutcome::Succeeded => PhaseOutcome::Success,
        _ => PhaseOutcome::Failure,
    };
    result.failures = failures;
    result.retries = retries;
    result.resolution = Some(outcome);
    result.detail = detail;
    Resolution { outcome, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingRepairer {
        calls: AtomicU32,
        seen: Mutex<Vec<Vec<Failure>>>,
        error: Option<String>,
    }

    #[async_trait]
    impl Repairer for CountingRepairer {
        async fn repair(&self, _phase: Phase, failures: &[Failure]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(failures.to_vec());
            match &self.error {
                Some(msg) => anyhow::bail!("{}", msg),
                None => Ok(()),
            }
        }
    }

    fn failed(msg: &str) -> AttemptOutcome {
        AttemptOutcome::Failed {
            failures: vec![Failure::message(msg)],
            retryable: true,
        }
    }

    #[tokio::test]
    async fn test_always_failing_exhausts_budget() {
        let repairer = CountingRepairer::default();
        let invocations = AtomicU32::new(0);
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Lint,
                |_| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { failed("unused import") }
                },
                &repairer,
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolution.outcome, ResolutionOutcome::Exhausted);
        assert_eq!(resolution.result.outcome, PhaseOutcome::Failure);
        assert_eq!(resolution.result.retries, 3);
        assert_eq!(resolution.result.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_then_pass_succeeds_after_one_repair() {
        let repairer = CountingRepairer::default();
        let invocations = AtomicU32::new(0);
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Test,
                |n| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 1 {
                            failed("test_login failed")
                        } else {
                            AttemptOutcome::Passed
                        }
                    }
                },
                &repairer,
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 1);
        assert!(resolution.succeeded());
        assert_eq!(resolution.result.outcome, PhaseOutcome::Success);
        assert_eq!(resolution.result.retries, 1);
        assert!(resolution.result.failures.is_empty());
        assert_eq!(
            repairer.seen.lock().unwrap()[0],
            vec![Failure::message("test_login failed")]
        );
    }

    #[tokio::test]
    async fn test_first_attempt_pass_has_no_retries() {
        let repairer = CountingRepairer::default();
        let resolution = RetryResolver::new(3)
            .resolve(Phase::Build, |_| async { AttemptOutcome::Passed }, &repairer)
            .await;
        assert!(resolution.succeeded());
        assert_eq!(resolution.result.retries, 0);
        assert_eq!(resolution.result.resolution, Some(ResolutionOutcome::Succeeded));
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_named_violation_is_repaired() {
        let repairer = CountingRepairer::default();
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Test,
                |n| async move {
                    if n == 1 {
                        failed("test_unauthorized_request_returns_401 failed: expected 401, got 500")
                    } else {
                        AttemptOutcome::Passed
                    }
                },
                &repairer,
            )
            .await;
        assert!(resolution.succeeded());
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolution.result.retries, 1);
    }

    #[tokio::test]
    async fn test_permission_failure_is_not_retried() {
        let repairer = CountingRepairer::default();
        let invocations = AtomicU32::new(0);
        let resolution = RetryResolver::new(5)
            .resolve(
                Phase::Build,
                |_| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async {
                        AttemptOutcome::Failed {
                            failures: vec![Failure::message("cargo: Permission denied (os error 13)")],
                            retryable: false,
                        }
                    }
                },
                &repairer,
            )
            .await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolution.outcome, ResolutionOutcome::NonRetryable);
        assert_eq!(resolution.result.retries, 1);
    }

    #[tokio::test]
    async fn test_explicit_non_retryable_flag() {
        let repairer = CountingRepairer::default();
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Review,
                |_| async {
                    AttemptOutcome::Failed {
                        failures: vec![Failure::message("cancelled")],
                        retryable: false,
                    }
                },
                &repairer,
            )
            .await;
        assert_eq!(resolution.outcome, ResolutionOutcome::NonRetryable);
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_repair_still_retries() {
        let repairer = CountingRepairer {
            error: Some("agent exited with status 1".to_string()),
            ..Default::default()
        };
        let invocations = AtomicU32::new(0);
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Lint,
                |n| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            failed("unused import")
                        } else {
                            AttemptOutcome::Passed
                        }
                    }
                },
                &repairer,
            )
            .await;
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert!(resolution.succeeded());
        assert_eq!(resolution.result.retries, 2);
    }

    #[tokio::test]
    async fn test_unauthorized_repair_ends_loop() {
        let repairer = CountingRepairer {
            error: Some("401 Unauthorized: invalid api key".to_string()),
            ..Default::default()
        };
        let invocations = AtomicU32::new(0);
        let resolution = RetryResolver::new(3)
            .resolve(
                Phase::Lint,
                |_| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { failed("unused import") }
                },
                &repairer,
            )
            .await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(resolution.outcome, ResolutionOutcome::NonRetryable);
        assert!(resolution.result.detail.unwrap().contains("repair failed"));
    }

    #[tokio::test]
    async fn test_zero_max_attempts_runs_once() {
        let repairer = CountingRepairer::default();
        let invocations = AtomicU32::new(0);
        let resolver = RetryResolver::new(0);
        assert_eq!(resolver.max_attempts(), 1);
        let resolution = resolver
            .resolve(
                Phase::Test,
                |_| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { failed("boom") }
                },
                &repairer,
            )
            .await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(resolution.outcome, ResolutionOutcome::Exhausted);
        assert!(resolution.result.retries <= resolver.max_attempts());
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("unused variable `x`"), FailureClass::Retryable);
        assert_eq!(
            classify_message("remote: HTTP 403 Forbidden"),
            FailureClass::NonRetryable
        );
        assert_eq!(
            classify_message("Authentication failed for 'https://github.com'"),
            FailureClass::NonRetryable
        );
    }
}
