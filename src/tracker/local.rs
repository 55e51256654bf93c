use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Issue, IssueTracker, NewIssue, NewPullRequest};
use crate::errors::TrackerError;

const PREFIX: &str = "local#";
const PULL_PREFIX: &str = "local-pr#";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalComment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One issue file, `<dir>/<number>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<LocalComment>,
    pub created_at: DateTime<Utc>,
}

impl LocalIssue {
    fn to_issue(&self) -> Issue {
        Issue {
            reference: format!("{}{}", PREFIX, self.number),
            title: self.title.clone(),
            body: self.body.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// One pull request file, `<dir>/pulls/<number>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalPullRequest {
    number: u64,
    head: String,
    base: Option<String>,
    title: String,
    body: String,
    created_at: DateTime<Utc>,
}

/// Offline tracker backed by JSON files. Writers serialize on a lock file so
/// parallel workflows can comment on the same parent.
pub struct LocalTracker {
    dir: PathBuf,
}

impl LocalTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Accepts `local#N`, `#N` and `N`.
    pub fn parse_reference(reference: &str) -> Result<u64, TrackerError> {
        let trimmed = reference.trim();
        let digits = trimmed
            .strip_prefix(PREFIX)
            .or_else(|| trimmed.strip_prefix('#'))
            .unwrap_or(trimmed);
        digits
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| TrackerError::InvalidReference(reference.to_string()))
    }

    fn issue_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}.json", number))
    }

    fn pulls_dir(&self) -> PathBuf {
        self.dir.join("pulls")
    }

    fn lock(&self) -> Result<File, TrackerError> {
        fs::create_dir_all(&self.dir).map_err(io_error)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))
            .map_err(io_error)?;
        file.lock_exclusive().map_err(io_error)?;
        Ok(file)
    }

    /// Read an issue file with its comments.
    pub fn load(&self, reference: &str) -> Result<LocalIssue, TrackerError> {
        let number = Self::parse_reference(reference)?;
        let path = self.issue_path(number);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrackerError::IssueNotFound {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_str(&contents).map_err(|e| {
            TrackerError::Other(anyhow::anyhow!("Corrupt issue file {}: {}", path.display(), e))
        })
    }

    fn store(&self, issue: &LocalIssue) -> Result<(), TrackerError> {
        write_json(&self.issue_path(issue.number), issue)
    }

    /// All issues, lowest number first.
    pub fn list(&self) -> Result<Vec<LocalIssue>, TrackerError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };
        let mut issues = Vec::new();
        for number in entries.flatten().filter_map(|e| numbered_json(&e.path())) {
            issues.push(self.load(&number.to_string())?);
        }
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }
}

fn numbered_json(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn next_number(dir: &Path) -> Result<u64, TrackerError> {
    let max = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| numbered_json(&e.path()))
            .max()
            .unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(io_error(e)),
    };
    Ok(max + 1)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrackerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| TrackerError::Other(anyhow::anyhow!("serialize: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp).map_err(io_error)?;
    file.write_all(json.as_bytes()).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)
}

fn io_error(e: std::io::Error) -> TrackerError {
    TrackerError::Other(e.into())
}

#[async_trait]
impl IssueTracker for LocalTracker {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get_issue(&self, reference: &str) -> Result<Issue, TrackerError> {
        self.load(reference).map(|issue| issue.to_issue())
    }

    async fn create_issue(&self, new: &NewIssue) -> Result<String, TrackerError> {
        let _lock = self.lock()?;
        let issue = LocalIssue {
            number: next_number(&self.dir)?,
            title: new.title.clone(),
            body: new.body.clone(),
            labels: new.labels.clone(),
            comments: Vec::new(),
            created_at: Utc::now(),
        };
        self.store(&issue)?;
        let reference = format!("{}{}", PREFIX, issue.number);
        info!(issue = %reference, title = %issue.title, "created local issue");
        Ok(reference)
    }

    async fn comment(&self, reference: &str, body: &str) -> Result<(), TrackerError> {
        let _lock = self.lock()?;
        let mut issue = self.load(reference)?;
        issue.comments.push(LocalComment {
            body: body.to_string(),
            created_at: Utc::now(),
        });
        self.store(&issue)?;
        debug!(issue = %reference, "comment recorded");
        Ok(())
    }

    async fn open_pull_request(&self, pull: &NewPullRequest) -> Result<String, TrackerError> {
        let _lock = self.lock()?;
        let number = next_number(&self.pulls_dir())?;
        let record = LocalPullRequest {
            number,
            head: pull.head.clone(),
            base: pull.base.clone(),
            title: pull.title.clone(),
            body: pull.body.clone(),
            created_at: Utc::now(),
        };
        write_json(&self.pulls_dir().join(format!("{}.json", number)), &record)?;
        Ok(format!("{}{}", PULL_PREFIX, number))
    }
}
