//! The AI backend seam.
//!
//! `complete` is a single request/response exchange (used by the analyzer);
//! `execute` is agentic work inside a workspace (one call per phase or
//! repair). `ClaudeCli` drives the `claude` CLI in stream-json mode.

pub mod claude;
pub mod stream;

pub use claude::ClaudeCli;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Agent: Send + Sync {
    /// One request/response exchange; returns the final text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Work inside `workdir` until done; returns the final text. Cancelling
    /// the token kills the agent process and yields an error.
    async fn execute(
        &self,
        workdir: &Path,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}
