use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Agent;
use super::stream::{ContentBlock, StreamEvent, describe_tool_use};
use crate::config::Config;
use crate::util::truncate;

/// Drives the agent CLI: prompt on stdin, stream-json events on stdout.
pub struct ClaudeCli {
    program: String,
    args: Vec<String>,
    project_dir: PathBuf,
}

impl ClaudeCli {
    pub fn new(program: impl Into<String>, args: Vec<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            project_dir: project_dir.into(),
        }
    }

    /// `agent_cmd` is shell-word split, so it may carry its own arguments.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut argv = shlex::split(&config.agent_cmd)
            .filter(|argv| !argv.is_empty())
            .with_context(|| format!("Invalid agent command: {}", config.agent_cmd))?;
        let program = argv.remove(0);
        argv.extend(config.agent_flags());
        Ok(Self::new(program, argv, &config.project_dir))
    }

    async fn run(&self, workdir: &Path, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        debug!(program = %self.program, workdir = %workdir.display(), prompt_chars = prompt.len(), "spawning agent");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", self.program))?;

        // Fed from its own task so a child that writes before it reads
        // cannot fill both pipes
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let streamed = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                if let Some(task) = &stdin_task {
                    task.abort();
                }
                bail!("Agent cancelled");
            }
            streamed = read_stream(stdout) => streamed?,
        };

        let status = child.wait().await.context("Failed to wait for agent")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if let Some(task) = stdin_task
            && let Ok(Err(e)) = task.await
        {
            warn!(error = %e, "agent did not read the whole prompt");
        }

        if streamed.is_error {
            bail!(
                "Agent reported an error: {}",
                truncate(streamed.output().trim(), 500)
            );
        }
        if !status.success() && streamed.final_result.is_none() {
            bail!(
                "Agent exited with status {}: {}",
                status.code().unwrap_or(-1),
                truncate(stderr.trim(), 500)
            );
        }
        if !status.success() {
            warn!(code = status.code().unwrap_or(-1), "agent exited non-zero after reporting a result");
        }
        Ok(streamed.output())
    }
}

#[derive(Debug, Default)]
struct Streamed {
    text: String,
    final_result: Option<String>,
    is_error: bool,
}

impl Streamed {
    /// The final result if one was reported, otherwise all streamed text.
    fn output(&self) -> String {
        self.final_result.clone().unwrap_or_else(|| self.text.clone())
    }
}

async fn read_stream(stdout: tokio::process::ChildStdout) -> Result<Streamed> {
    let mut reader = BufReader::new(stdout).lines();
    let mut streamed = Streamed::default();

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(&line) {
            Ok(StreamEvent::Assistant { message, .. }) => {
                for block in message.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            debug!(tool = %describe_tool_use(&name, &input), "agent tool use");
                        }
                        ContentBlock::Text { text } => {
                            streamed.text.push_str(&text);
                            streamed.text.push('\n');
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                result, is_error, ..
            }) => {
                streamed.final_result = result;
                streamed.is_error = is_error;
            }
            Ok(StreamEvent::User {} | StreamEvent::System { .. }) => {}
            Err(_) => {
                // Plain text (e.g. a CLI running in text mode)
                streamed.text.push_str(&line);
                streamed.text.push('\n');
            }
        }
    }
    Ok(streamed)
}

#[async_trait]
impl Agent for ClaudeCli {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.run(&self.project_dir, prompt, &CancellationToken::new())
            .await
    }

    async fn execute(
        &self,
        workdir: &Path,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.run(workdir, prompt, cancel).await
    }
}
