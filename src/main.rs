use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conveyor::exit_codes;

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Drive a tracked issue through plan, build, test, review and ship")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true, env = "CONVEYOR_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze an issue and run its workflow (exit 0 done, 10 decomposed, 1 error)
    Run {
        /// Issue reference, e.g. local#3 or owner/name#42
        issue: String,

        /// Resume or name a workflow instead of starting a fresh one
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Run the analyzer only and print the validated plan
    Analyze {
        issue: String,

        /// Create the sub-issues when the plan decomposes
        #[arg(long)]
        materialize: bool,
    },
    /// Show one workflow in detail, or all active workflows
    Status { id: Option<String> },
    /// Abort a running workflow and release its lease
    Abort { id: String },
    /// Release a workflow's lease (idempotent)
    Release { id: String },
    /// Show the resource slot table
    Leases,
    /// Manage issues in the local tracker
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },
    /// View, create or validate conveyor.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum IssueCommands {
    /// Create an issue
    Create {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Label to attach (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// List issues
    List,
    /// Show an issue with its comments
    Show { reference: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conveyor.toml file
    Init,
}

impl Commands {
    /// Commands that drive agents or workflows also log to `.conveyor/logs`.
    fn logs_to_file(&self) -> bool {
        matches!(
            self,
            Commands::Run { .. } | Commands::Analyze { .. } | Commands::Abort { .. }
        )
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

/// Runs the command and returns the process exit code. The log guard drops
/// here, before `exit`, so buffered log lines are flushed.
async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let log_dir = project_dir.join(".conveyor").join("logs");
    let _guard = conveyor::logging::init(
        cli.verbose,
        cli.command.logs_to_file().then_some(log_dir.as_path()),
    );

    match &cli.command {
        Commands::Run { issue, workflow } => {
            cmd::cmd_run(&project_dir, cli.verbose, issue, workflow.as_deref()).await
        }
        Commands::Analyze { issue, materialize } => {
            cmd::cmd_analyze(&project_dir, cli.verbose, issue, *materialize).await
        }
        Commands::Status { id } => cmd::cmd_status(&project_dir, id.as_deref()).map(|_| exit_codes::OK),
        Commands::Abort { id } => cmd::cmd_abort(&project_dir, cli.verbose, id)
            .await
            .map(|_| exit_codes::OK),
        Commands::Release { id } => cmd::cmd_release(&project_dir, id).map(|_| exit_codes::OK),
        Commands::Leases => cmd::cmd_leases(&project_dir).map(|_| exit_codes::OK),
        Commands::Issue { command } => cmd::cmd_issue(&project_dir, command.clone())
            .await
            .map(|_| exit_codes::OK),
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone()).map(|_| exit_codes::OK)
        }
    }
}
