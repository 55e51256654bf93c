use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Issue, IssueTracker, NewIssue, NewPullRequest};
use crate::errors::TrackerError;
use crate::util::truncate;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "conveyor";

/// A GitHub issue (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueBody<'a> {
    title: &'a str,
    body: &'a str,
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

/// Parse an issue reference into `(owner/name, number)`.
///
/// Handles:
/// - `owner/name#12`
/// - `#12` and `12` (against `default_repo`)
/// - `https://github.com/owner/name/issues/12`
pub fn parse_reference(reference: &str, default_repo: &str) -> Result<(String, u64), TrackerError> {
    let invalid = || TrackerError::InvalidReference(reference.to_string());
    let trimmed = reference.trim();

    if let Some(path) = trimmed.strip_prefix("https://github.com/") {
        let parts: Vec<&str> = path.trim_end_matches('/').split('/').collect();
        if parts.len() == 4 && matches!(parts[2], "issues" | "pull") {
            let number = parts[3].parse().map_err(|_| invalid())?;
            return Ok((format!("{}/{}", parts[0], parts[1]), number));
        }
        return Err(invalid());
    }

    let (repo, number) = match trimmed.split_once('#') {
        Some(("", number)) => (default_repo, number),
        Some((repo, number)) => (repo, number),
        None => (default_repo, trimmed),
    };
    let number: u64 = number.parse().map_err(|_| invalid())?;
    if number == 0 || !is_repo_slug(repo) {
        return Err(invalid());
    }
    Ok((repo.to_string(), number))
}

fn is_repo_slug(repo: &str) -> bool {
    let parts: Vec<&str> = repo.split('/').collect();
    parts.len() == 2 && parts.iter().all(|p| !p.is_empty())
}

/// Map a failed response to a tracker error. 403 counts as a rate limit only
/// when GitHub says so through its headers.
pub(crate) fn classify_failure(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now_epoch: i64,
) -> TrackerError {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let retry_after = header("retry-after").and_then(|v| v.trim().parse::<u64>().ok());
    let exhausted = header("x-ratelimit-remaining").is_some_and(|v| v.trim() == "0");
    let reset_wait = header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| (reset - now_epoch).max(0) as u64);

    match status {
        StatusCode::TOO_MANY_REQUESTS => TrackerError::RateLimited {
            retry_after: retry_after.or(reset_wait),
        },
        StatusCode::FORBIDDEN if exhausted || retry_after.is_some() => TrackerError::RateLimited {
            retry_after: retry_after.or(reset_wait),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TrackerError::Unauthorized(format!("HTTP {}: {}", status.as_u16(), truncate(body, 200)))
        }
        _ => TrackerError::Request(format!("HTTP {}: {}", status.as_u16(), truncate(body, 200))),
    }
}

/// GitHub REST client scoped to one repository.
pub struct GitHubTracker {
    client: reqwest::Client,
    api_base: String,
    token: String,
    repository: String,
}

impl GitHubTracker {
    pub fn new(token: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: GITHUB_API_URL.to_string(),
            token: token.into(),
            repository: repository.into(),
        }
    }

    /// Token from `GITHUB_TOKEN`; `GITHUB_API_URL` overrides the API base.
    pub fn from_env(repository: &str) -> anyhow::Result<Self> {
        if !is_repo_slug(repository) {
            anyhow::bail!("tracker.repository must be owner/name, got '{}'", repository);
        }
        let token = std::env::var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN must be set for the github tracker")?;
        let mut tracker = Self::new(token, repository);
        if let Ok(base) = std::env::var("GITHUB_API_URL") {
            tracker.api_base = base.trim_end_matches('/').to_string();
        }
        Ok(tracker)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, TrackerError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| TrackerError::Request(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(
            status,
            &headers,
            &body,
            chrono::Utc::now().timestamp(),
        ))
    }

    async fn default_branch(&self) -> Result<String, TrackerError> {
        let resp = self
            .send(self.request(reqwest::Method::GET, &format!("repos/{}", self.repository)))
            .await?;
        let info: RepoInfo = resp
            .json()
            .await
            .map_err(|e| TrackerError::Request(format!("Failed to parse repository: {}", e)))?;
        Ok(info.default_branch)
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn get_issue(&self, reference: &str) -> Result<Issue, TrackerError> {
        let (repo, number) = parse_reference(reference, &self.repository)?;
        let path = format!("repos/{}/issues/{}", repo, number);
        let resp = match self.send(self.request(reqwest::Method::GET, &path)).await {
            Err(TrackerError::Request(msg)) if msg.starts_with("HTTP 404") => {
                return Err(TrackerError::IssueNotFound {
                    reference: reference.to_string(),
                });
            }
            other => other?,
        };
        let issue: GitHubIssue = resp
            .json()
            .await
            .map_err(|e| TrackerError::Request(format!("Failed to parse issue: {}", e)))?;
        Ok(Issue {
            reference: format!("{}#{}", repo, issue.number),
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
        })
    }

    async fn create_issue(&self, new: &NewIssue) -> Result<String, TrackerError> {
        let path = format!("repos/{}/issues", self.repository);
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&CreateIssueBody {
                title: &new.title,
                body: &new.body,
                labels: &new.labels,
            }))
            .await?;
        let created: GitHubIssue = resp
            .json()
            .await
            .map_err(|e| TrackerError::Request(format!("Failed to parse created issue: {}", e)))?;
        debug!(number = created.number, "created GitHub issue");
        Ok(format!("{}#{}", self.repository, created.number))
    }

    async fn comment(&self, reference: &str, body: &str) -> Result<(), TrackerError> {
        let (repo, number) = parse_reference(reference, &self.repository)?;
        let path = format!("repos/{}/issues/{}/comments", repo, number);
        self.send(
            self.request(reqwest::Method::POST, &path)
                .json(&serde_json::json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    async fn open_pull_request(&self, pull: &NewPullRequest) -> Result<String, TrackerError> {
        let base = match &pull.base {
            Some(base) => base.clone(),
            None => self.default_branch().await?,
        };
        let path = format!("repos/{}/pulls", self.repository);
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&CreatePullBody {
                title: &pull.title,
                head: &pull.head,
                base: &base,
                body: &pull.body,
            }))
            .await?;
        let created: CreatedPull = resp
            .json()
            .await
            .map_err(|e| TrackerError::Request(format!("Failed to parse pull request: {}", e)))?;
        Ok(created.html_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    // ── parse_reference ──────────────────────────────────────────────

    #[test]
    fn test_parse_full_reference() {
        assert_eq!(
            parse_reference("acme/widgets#42", "other/repo").unwrap(),
            ("acme/widgets".to_string(), 42)
        );
    }

    #[test]
    fn test_parse_short_references_use_default_repo() {
        assert_eq!(
            parse_reference("#7", "acme/widgets").unwrap(),
            ("acme/widgets".to_string(), 7)
        );
        assert_eq!(
            parse_reference("7", "acme/widgets").unwrap(),
            ("acme/widgets".to_string(), 7)
        );
    }

    #[test]
    fn test_parse_issue_url() {
        assert_eq!(
            parse_reference("https://github.com/acme/widgets/issues/9", "x/y").unwrap(),
            ("acme/widgets".to_string(), 9)
        );
    }

    #[test]
    fn test_parse_invalid_references() {
        for bad in ["", "abc", "acme#1", "acme/widgets#x", "#0", "https://github.com/acme"] {
            assert!(
                matches!(
                    parse_reference(bad, "acme/widgets"),
                    Err(TrackerError::InvalidReference(_))
                ),
                "expected invalid for {:?}",
                bad
            );
        }
    }

    // ── classify_failure ─────────────────────────────────────────────

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_429_with_retry_after() {
        let err = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "30")]),
            "",
            0,
        );
        assert!(matches!(err, TrackerError::RateLimited { retry_after: Some(30) }));
    }

    #[test]
    fn test_403_with_exhausted_quota_uses_reset() {
        let err = classify_failure(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1100")]),
            "API rate limit exceeded",
            1000,
        );
        assert!(matches!(err, TrackerError::RateLimited { retry_after: Some(100) }));
    }

    #[test]
    fn test_plain_403_is_unauthorized() {
        let err = classify_failure(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "4999")]),
            "Resource not accessible by integration",
            0,
        );
        assert!(matches!(err, TrackerError::Unauthorized(_)));
    }

    #[test]
    fn test_401_is_unauthorized() {
        let err = classify_failure(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "Bad credentials", 0);
        match err {
            TrackerError::Unauthorized(msg) => assert!(msg.contains("Bad credentials")),
            other => panic!("Expected Unauthorized, got {:?}", other),
        }
    }

    #[test]
    fn test_other_status_is_request_error() {
        let err = classify_failure(StatusCode::NOT_FOUND, &HeaderMap::new(), "Not Found", 0);
        match err {
            TrackerError::Request(msg) => assert!(msg.starts_with("HTTP 404")),
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_from_env_rejects_bad_slug() {
        assert!(GitHubTracker::from_env("not-a-slug").is_err());
    }
}
