//! Offline issue management against the local tracker (`conveyor issue`).

use anyhow::Result;
use console::style;
use std::path::Path;

use conveyor::tracker::local::LocalTracker;
use conveyor::tracker::{IssueTracker, NewIssue};

use super::super::IssueCommands;
use super::load_config;

pub async fn cmd_issue(project_dir: &Path, command: IssueCommands) -> Result<()> {
    let config = load_config(project_dir, false)?;
    let tracker = LocalTracker::new(&config.issues_dir);

    match command {
        IssueCommands::Create {
            title,
            body,
            labels,
        } => {
            let reference = tracker
                .create_issue(&NewIssue {
                    title,
                    body,
                    labels,
                })
                .await?;
            println!("Created {}", reference);
        }
        IssueCommands::List => {
            let issues = tracker.list()?;
            println!();
            if issues.is_empty() {
                println!("No issues in {}", tracker.dir().display());
            } else {
                println!("{:<10} {:<9} Title", "Issue", "Comments");
                println!("{:<10} {:<9} -----", "-----", "--------");
                for issue in &issues {
                    let labels = if issue.labels.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", issue.labels.join(", "))
                    };
                    println!(
                        "{:<10} {:<9} {}{}",
                        format!("local#{}", issue.number),
                        issue.comments.len(),
                        issue.title,
                        style(labels).dim()
                    );
                }
            }
            println!();
        }
        IssueCommands::Show { reference } => {
            let issue = tracker.load(&reference)?;
            println!();
            println!("{} {}", style(format!("local#{}", issue.number)).bold(), issue.title);
            if !issue.labels.is_empty() {
                println!("Labels: {}", issue.labels.join(", "));
            }
            println!("Created: {}", issue.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if !issue.body.trim().is_empty() {
                println!();
                println!("{}", issue.body.trim_end());
            }
            for comment in &issue.comments {
                println!();
                println!(
                    "{}",
                    style(format!(
                        "--- comment {} ---",
                        comment.created_at.format("%Y-%m-%d %H:%M:%S")
                    ))
                    .dim()
                );
                println!("{}", comment.body.trim_end());
            }
            println!();
        }
    }
    Ok(())
}
