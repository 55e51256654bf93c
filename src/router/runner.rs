use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ToolKind;
use super::result::{RouteOutcome, ToolResult, capped_result, parse_tool_output};
use crate::config::Config;
use crate::errors::ToolError;
use crate::resources::ResourceLease;
use crate::util::truncate;

const STDERR_LOG_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Global capability flag; false delegates every check
    pub external: bool,
    pub commands: HashMap<ToolKind, String>,
    pub timeout: Duration,
    pub max_failures: usize,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        let commands = ToolKind::ALL
            .into_iter()
            .filter_map(|kind| {
                config
                    .toml
                    .tools
                    .command_for(kind)
                    .map(|cmd| (kind, cmd.to_string()))
            })
            .collect();
        Self {
            external: config.external_tools,
            commands,
            timeout: config.tool_timeout(),
            max_failures: config.toml.tools.max_failures,
        }
    }
}

/// Runs configured checkers in a leased workspace and reduces their output
/// to a structured failure list.
pub struct ExternalToolRouter {
    settings: RouterSettings,
}

impl ExternalToolRouter {
    pub fn new(settings: RouterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Run the `kind` checker for `lease`.
    ///
    /// The command line is shell-word split and receives the workspace path
    /// and the kind as its last two arguments. It runs inside the workspace
    /// with the lease's ports in the environment. A missing program is
    /// treated like an unconfigured tool and delegated.
    pub async fn run(
        &self,
        kind: ToolKind,
        lease: &ResourceLease,
        cancel: &CancellationToken,
    ) -> RouteOutcome {
        if !self.settings.external {
            debug!(tool = %kind, "external tools disabled; delegating");
            return RouteOutcome::Delegated;
        }
        let Some(command) = self.settings.commands.get(&kind) else {
            debug!(tool = %kind, "no command configured; delegating");
            return RouteOutcome::Delegated;
        };
        let argv = match shlex::split(command) {
            Some(argv) if !argv.is_empty() => argv,
            _ => {
                return RouteOutcome::Completed(ToolResult::Error {
                    message: format!("{} tool command cannot be parsed: {}", kind, command),
                });
            }
        };

        let workspace = lease.workspace.to_string_lossy().to_string();
        let spawned = Command::new(&argv[0])
            .args(&argv[1..])
            .arg(&workspace)
            .arg(kind.as_str())
            .current_dir(&lease.workspace)
            .env("CONVEYOR_WORKSPACE", &workspace)
            .env("CONVEYOR_TOOL_KIND", kind.as_str())
            .env("CONVEYOR_PORT_PRIMARY", lease.ports.primary.to_string())
            .env("CONVEYOR_PORT_SECONDARY", lease.ports.secondary.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(tool = %kind, program = %argv[0], "checker not installed; delegating");
                return RouteOutcome::Delegated;
            }
            Err(source) => {
                return RouteOutcome::Completed(
                    ToolError::Spawn {
                        kind: kind.to_string(),
                        source,
                    }
                    .into(),
                );
            }
        };

        debug!(tool = %kind, workflow = %lease.workflow_id, command = %command, "checker started");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(tool = %kind, workflow = %lease.workflow_id, "checker cancelled");
                return RouteOutcome::Aborted;
            }
            waited = tokio::time::timeout(self.settings.timeout, child.wait_with_output()) => waited,
        };

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return RouteOutcome::Completed(
                    ToolError::Crashed {
                        kind: kind.to_string(),
                        message: e.to_string(),
                    }
                    .into(),
                );
            }
            Err(_) => {
                warn!(tool = %kind, secs = self.settings.timeout.as_secs(), "checker timed out");
                return RouteOutcome::Completed(
                    ToolError::Timeout {
                        kind: kind.to_string(),
                        secs: self.settings.timeout.as_secs(),
                    }
                    .into(),
                );
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(tool = %kind, stderr = %truncate(stderr.trim(), STDERR_LOG_LIMIT), "checker stderr");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = match parse_tool_output(kind, &stdout) {
            Ok(failures) => {
                let (result, dropped) = capped_result(failures, self.settings.max_failures);
                if dropped > 0 {
                    debug!(tool = %kind, dropped, "failure list capped");
                }
                result
            }
            Err(_) if !output.status.success() => ToolError::Crashed {
                kind: kind.to_string(),
                message: match output.status.code() {
                    Some(code) => format!("exited with status {} without valid output", code),
                    None => "terminated by signal without valid output".to_string(),
                },
            }
            .into(),
            Err(malformed) => malformed.into(),
        };

        info!(
            tool = %kind,
            workflow = %lease.workflow_id,
            passed = result.is_passed(),
            failures = result.failures().len(),
            "checker finished"
        );
        RouteOutcome::Completed(result)
    }
}
