//! Issue tracker seam: issues in, comments, sub-issues and pull requests out.
//!
//! Two implementations:
//! - [`LocalTracker`]: JSON files under `.conveyor/issues/`, references `local#N`
//! - [`GitHubTracker`]: GitHub REST API, references `owner/name#N` or `#N`

pub mod github;
pub mod local;

pub use github::GitHubTracker;
pub use local::LocalTracker;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::conveyor_config::TrackerKind;
use crate::errors::TrackerError;

/// Longest pause between rate-limited attempts.
const MAX_BACKOFF_SECS: u64 = 60;

/// An issue as the orchestrator consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub reference: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// An issue to be created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// A pull request to be opened from `head` into the default branch (or `base`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub head: String,
    pub base: Option<String>,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Short name for logs ("local", "github").
    fn name(&self) -> &'static str;

    async fn get_issue(&self, reference: &str) -> Result<Issue, TrackerError>;

    /// Returns the reference of the created issue.
    async fn create_issue(&self, issue: &NewIssue) -> Result<String, TrackerError>;

    async fn comment(&self, reference: &str, body: &str) -> Result<(), TrackerError>;

    /// Returns a URL or reference for the opened pull request.
    async fn open_pull_request(&self, pull: &NewPullRequest) -> Result<String, TrackerError>;
}

/// Build the tracker selected by `[tracker] kind`.
pub fn from_config(config: &Config) -> Result<Arc<dyn IssueTracker>> {
    match config.toml.tracker.kind {
        TrackerKind::Local => Ok(Arc::new(LocalTracker::new(&config.issues_dir))),
        TrackerKind::Github => {
            let repository = config
                .toml
                .tracker
                .repository
                .clone()
                .context("tracker.repository must be set for the github tracker")?;
            Ok(Arc::new(GitHubTracker::from_env(&repository)?))
        }
    }
}

/// Run `op`, retrying up to `retries` more times while the tracker reports a
/// rate limit. Waits `retry_after` seconds when given, otherwise doubles from
/// one second, capped at a minute.
pub async fn with_rate_limit_retry<T, F, Fut>(retries: u32, mut op: F) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(TrackerError::RateLimited { retry_after }) if attempt < retries => {
                let wait = retry_after
                    .unwrap_or_else(|| 1u64 << attempt.min(6))
                    .min(MAX_BACKOFF_SECS);
                attempt += 1;
                warn!(attempt, wait_secs = wait, "issue tracker rate limited; backing off");
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_rate_limit_retry(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TrackerError::RateLimited {
                        retry_after: Some(0),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let err = with_rate_limit_retry(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(TrackerError::RateLimited {
                    retry_after: Some(0),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TrackerError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_rate_limit_retry(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TrackerError::Unauthorized("bad token".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TrackerError::Unauthorized(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
