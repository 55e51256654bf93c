use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conveyor_config::{CONFIG_FILE_NAME, ConveyorToml};

/// Runtime configuration for Conveyor.
///
/// Resolves every on-disk location under `<project>/.conveyor/` and carries
/// the parsed `conveyor.toml` with environment and CLI overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conveyor_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub issues_dir: PathBuf,
    pub log_dir: PathBuf,
    pub agent_cmd: String,
    pub external_tools: bool,
    pub verbose: bool,
    pub toml: ConveyorToml,
}

impl Config {
    /// Load configuration for a project directory (file, then environment).
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let conveyor_dir = project_dir.join(".conveyor");
        let toml = ConveyorToml::load_or_default(&conveyor_dir)?;
        Ok(Self::from_toml(project_dir, toml, verbose))
    }

    /// Build from an already-parsed file. Paths are not canonicalized.
    pub fn from_toml(project_dir: PathBuf, toml: ConveyorToml, verbose: bool) -> Self {
        let conveyor_dir = project_dir.join(".conveyor");
        let workspace_root = resolve(&project_dir, &toml.resources.workspace_root);
        Self {
            workflows_dir: conveyor_dir.join("workflows"),
            resources_dir: conveyor_dir.join("resources"),
            issues_dir: conveyor_dir.join("issues"),
            log_dir: conveyor_dir.join("logs"),
            agent_cmd: toml.agent_cmd(),
            external_tools: toml.external_tools(),
            workspace_root,
            conveyor_dir,
            project_dir,
            verbose,
            toml,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.conveyor_dir.join(CONFIG_FILE_NAME)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.workflows_dir,
            &self.resources_dir,
            &self.workspace_root,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.tools.timeout_secs)
    }

    /// Flags passed to the agent CLI ahead of the prompt.
    pub fn agent_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.toml.project.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
