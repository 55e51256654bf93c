//! The `.conveyor/conveyor.toml` schema.
//!
//! Every section is optional and every field has a default, so an empty file
//! (or no file) is a valid configuration.
//!
//! ```toml
//! [project]
//! name = "my-project"
//! agent_cmd = "claude"
//! skip_permissions = true
//!
//! [resources]
//! pool_size = 4
//! base_port = 41000
//! workspace_root = ".conveyor/workspaces"
//! isolation = "worktree"
//!
//! [tools]
//! external = true
//! timeout_secs = 600
//! max_failures = 50
//! build = "cargo-check-json"
//! lint = "clippy-json"
//! test = "test-json"
//!
//! [retry]
//! max_attempts = 3
//!
//! [analyzer]
//! min_confidence = 0.6
//!
//! [tracker]
//! kind = "local"
//! repository = "owner/name"
//! rate_limit_retries = 3
//!
//! [ship]
//! push = false
//! open_pull_request = false
//! remote = "origin"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::router::ToolKind;

pub const CONFIG_FILE_NAME: &str = "conveyor.toml";

/// How workflow workspaces are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// A git worktree on a fresh branch (requires the project to be a repository).
    #[default]
    Worktree,
    /// A plain empty directory.
    Directory,
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::Worktree => write!(f, "worktree"),
            Isolation::Directory => write!(f, "directory"),
        }
    }
}

/// Which issue tracker backs the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Local,
    Github,
}

impl std::fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerKind::Local => write!(f, "local"),
            TrackerKind::Github => write!(f, "github"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub agent_cmd: Option<String>,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            agent_cmd: None,
            skip_permissions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesSection {
    /// Number of concurrent workflow slots
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// First port of the pool; slot i owns base+2i and base+2i+1
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Relative paths are resolved against the project directory
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default)]
    pub isolation: Isolation,
}

fn default_pool_size() -> usize {
    4
}

fn default_base_port() -> u16 {
    41000
}

fn default_workspace_root() -> String {
    ".conveyor/workspaces".to_string()
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            base_port: default_base_port(),
            workspace_root: default_workspace_root(),
            isolation: Isolation::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    /// Capability flag: when false every check is delegated to the agent
    #[serde(default = "default_true")]
    pub external: bool,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Cap on failures handed to a repair attempt
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

fn default_tool_timeout() -> u64 {
    600
}

fn default_max_failures() -> usize {
    50
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            external: true,
            timeout_secs: default_tool_timeout(),
            max_failures: default_max_failures(),
            build: None,
            lint: None,
            test: None,
        }
    }
}

impl ToolsSection {
    /// The configured command line for a tool kind, if any.
    pub fn command_for(&self, kind: ToolKind) -> Option<&str> {
        let cmd = match kind {
            ToolKind::Build => self.build.as_deref(),
            ToolKind::Lint => self.lint.as_deref(),
            ToolKind::Test => self.test.as_deref(),
        };
        cmd.filter(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSection {
    /// Atomic decisions below this confidence are logged as a warning
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    0.6
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    #[serde(default)]
    pub kind: TrackerKind,
    /// `owner/name`, required for the github tracker
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
}

fn default_rate_limit_retries() -> u32 {
    3
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            kind: TrackerKind::default(),
            repository: None,
            rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipSection {
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub open_pull_request: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for ShipSection {
    fn default() -> Self {
        Self {
            push: false,
            open_pull_request: false,
            remote: default_remote(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// The complete conveyor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConveyorToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub ship: ShipSection,
}

impl ConveyorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conveyor.toml")
    }

    /// Load `<conveyor_dir>/conveyor.toml`, or defaults when it doesn't exist.
    pub fn load_or_default(conveyor_dir: &Path) -> Result<Self> {
        let path = conveyor_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conveyor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command: file, then `CONVEYOR_AGENT_CMD`, then "claude".
    pub fn agent_cmd(&self) -> String {
        self.project
            .agent_cmd
            .clone()
            .or_else(|| std::env::var("CONVEYOR_AGENT_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// External tool capability; `CONVEYOR_EXTERNAL_TOOLS` overrides the file.
    pub fn external_tools(&self) -> bool {
        env_flag(
            std::env::var("CONVEYOR_EXTERNAL_TOOLS").ok(),
            self.tools.external,
        )
    }

    /// Human-readable problems with the configuration. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.resources.pool_size == 0 {
            warnings.push("resources.pool_size must be at least 1".to_string());
        }
        let last_port = self.resources.base_port as u64 + 2 * self.resources.pool_size as u64;
        if last_port > u16::MAX as u64 + 1 {
            warnings.push(format!(
                "resources.base_port {} with pool_size {} runs past port 65535",
                self.resources.base_port, self.resources.pool_size
            ));
        }
        if self.tools.timeout_secs == 0 {
            warnings.push("tools.timeout_secs must be greater than 0".to_string());
        }
        if self.tools.max_failures == 0 {
            warnings.push("tools.max_failures must be at least 1".to_string());
        }
        for kind in ToolKind::ALL {
            if let Some(cmd) = self.tools.command_for(kind)
                && shlex::split(cmd).is_none()
            {
                warnings.push(format!("tools.{} has unbalanced quoting: {}", kind, cmd));
            }
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; treated as 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.analyzer.min_confidence) {
            warnings.push(format!(
                "analyzer.min_confidence {} is outside [0, 1]",
                self.analyzer.min_confidence
            ));
        }
        if self.tracker.kind == TrackerKind::Github {
            match self.tracker.repository.as_deref() {
                None => warnings.push(
                    "tracker.repository is required when tracker.kind = \"github\"".to_string(),
                ),
                Some(repo) if repo.split('/').filter(|p| !p.is_empty()).count() != 2 => {
                    warnings.push(format!(
                        "tracker.repository '{}' should be 'owner/name'",
                        repo
                    ))
                }
                Some(_) => {}
            }
        }
        if self.ship.open_pull_request && !self.ship.push {
            warnings.push("ship.open_pull_request requires ship.push = true".to_string());
        }

        warnings
    }
}

/// Parse a boolean environment override, falling back when unset or unrecognized.
fn env_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg = ConveyorToml::parse("").unwrap();
        assert_eq!(cfg.resources.pool_size, 4);
        assert_eq!(cfg.resources.base_port, 41000);
        assert_eq!(cfg.resources.isolation, Isolation::Worktree);
        assert!(cfg.tools.external);
        assert_eq!(cfg.tools.timeout_secs, 600);
        assert_eq!(cfg.tools.max_failures, 50);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.analyzer.min_confidence, 0.6);
        assert_eq!(cfg.tracker.kind, TrackerKind::Local);
        assert_eq!(cfg.tracker.rate_limit_retries, 3);
        assert!(!cfg.ship.push);
        assert_eq!(cfg.ship.remote, "origin");
        assert!(cfg.project.skip_permissions);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[project]
name = "demo"
agent_cmd = "my-agent"
skip_permissions = false

[resources]
pool_size = 2
base_port = 50000
isolation = "directory"

[tools]
external = false
lint = "clippy-json --strict"

[retry]
max_attempts = 5

[tracker]
kind = "github"
repository = "acme/widgets"

[ship]
push = true
open_pull_request = true
"#;
        let cfg = ConveyorToml::parse(content).unwrap();
        assert_eq!(cfg.project.name.as_deref(), Some("demo"));
        assert_eq!(cfg.project.agent_cmd.as_deref(), Some("my-agent"));
        assert!(!cfg.project.skip_permissions);
        assert_eq!(cfg.resources.pool_size, 2);
        assert_eq!(cfg.resources.isolation, Isolation::Directory);
        assert!(!cfg.tools.external);
        assert_eq!(
            cfg.tools.command_for(ToolKind::Lint),
            Some("clippy-json --strict")
        );
        assert_eq!(cfg.tools.command_for(ToolKind::Build), None);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.tracker.kind, TrackerKind::Github);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_blank_command_is_unconfigured() {
        let cfg = ConveyorToml::parse("[tools]\ntest = \"   \"\n").unwrap();
        assert_eq!(cfg.tools.command_for(ToolKind::Test), None);
    }

    #[test]
    fn test_validate_reports_problems() {
        let content = r#"
[resources]
pool_size = 0

[analyzer]
min_confidence = 1.5

[tracker]
kind = "github"

[ship]
open_pull_request = true
"#;
        let warnings = ConveyorToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("pool_size")));
        assert!(warnings.iter().any(|w| w.contains("min_confidence")));
        assert!(warnings.iter().any(|w| w.contains("tracker.repository")));
        assert!(warnings.iter().any(|w| w.contains("open_pull_request")));
    }

    #[test]
    fn test_validate_port_overflow() {
        let cfg = ConveyorToml::parse("[resources]\nbase_port = 65530\npool_size = 8\n").unwrap();
        assert!(cfg.validate().iter().any(|w| w.contains("65535")));
    }

    #[test]
    fn test_invalid_isolation_is_parse_error() {
        assert!(ConveyorToml::parse("[resources]\nisolation = \"container\"\n").is_err());
    }

    #[test]
    fn test_save_and_load_or_default() {
        let dir = tempdir().unwrap();
        let defaults = ConveyorToml::load_or_default(dir.path()).unwrap();
        assert_eq!(defaults.resources.pool_size, 4);

        let mut cfg = ConveyorToml::default();
        cfg.resources.pool_size = 7;
        cfg.tools.build = Some("make check".to_string());
        cfg.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

        let loaded = ConveyorToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.resources.pool_size, 7);
        assert_eq!(loaded.tools.build.as_deref(), Some("make check"));
    }

    #[test]
    fn test_env_flag() {
        assert!(env_flag(Some("true".into()), false));
        assert!(env_flag(Some("1".into()), false));
        assert!(!env_flag(Some("off".into()), true));
        assert!(env_flag(Some("garbage".into()), true));
        assert!(!env_flag(None, false));
    }
}
