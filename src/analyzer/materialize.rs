use std::fmt::Write as _;
use tracing::{debug, info, warn};

use super::types::{Decision, DecompositionPlan};
use super::validate::creation_order;
use crate::errors::WorkflowError;
use crate::tracker::{Issue, IssueTracker, NewIssue, with_rate_limit_retry};

/// Create the plan's sub-issues in dependency order and post one summary on
/// the parent. Returns the created references indexed like `plan.sub_issues`.
///
/// Each body links back to the parent and to the already-created siblings it
/// depends on; once all exist, each sub-issue gets a comment listing its
/// siblings. An atomic plan creates nothing.
pub async fn materialize(
    plan: &DecompositionPlan,
    parent: &Issue,
    tracker: &dyn IssueTracker,
    rate_limit_retries: u32,
) -> Result<Vec<String>, WorkflowError> {
    materialize_resuming(plan, parent, tracker, rate_limit_retries, Vec::new(), |_| Ok(())).await
}

/// [`materialize`] picking up from `created`, the references an interrupted
/// run already made (indexed like `plan.sub_issues`). Those are not created
/// again. `on_created` sees the progress after every new issue; an error
/// from it stops the run.
pub async fn materialize_resuming<F>(
    plan: &DecompositionPlan,
    parent: &Issue,
    tracker: &dyn IssueTracker,
    rate_limit_retries: u32,
    mut created: Vec<Option<String>>,
    mut on_created: F,
) -> Result<Vec<String>, WorkflowError>
where
    F: FnMut(&[Option<String>]) -> Result<(), WorkflowError>,
{
    if plan.decision == Decision::Atomic {
        return Ok(Vec::new());
    }
    let order = creation_order(plan)?;
    created.resize(plan.sub_issues.len(), None);

    for index in order {
        if let Some(existing) = &created[index] {
            debug!(parent = %parent.reference, sub_issue = %existing, index, "sub-issue already created");
            continue;
        }
        let sub = &plan.sub_issues[index];
        let new = NewIssue {
            title: sub.title.clone(),
            body: sub_issue_body(plan, index, parent, &created),
            labels: sub.labels.clone(),
        };
        let reference =
            with_rate_limit_retry(rate_limit_retries, || tracker.create_issue(&new)).await?;
        info!(parent = %parent.reference, sub_issue = %reference, index, "created sub-issue");
        created[index] = Some(reference);
        on_created(&created)?;
    }

    let refs: Vec<String> = created.into_iter().flatten().collect();
    let summary = summary_comment(plan, &refs);
    with_rate_limit_retry(rate_limit_retries, || {
        tracker.comment(&parent.reference, &summary)
    })
    .await?;

    for (index, reference) in refs.iter().enumerate() {
        let body = sibling_comment(plan, parent, &refs, index);
        let posted =
            with_rate_limit_retry(rate_limit_retries, || tracker.comment(reference, &body)).await;
        if let Err(e) = posted {
            warn!(sub_issue = %reference, error = %e, "failed to link siblings");
        }
    }
    Ok(refs)
}

fn sub_issue_body(
    plan: &DecompositionPlan,
    index: usize,
    parent: &Issue,
    created: &[Option<String>],
) -> String {
    let sub = &plan.sub_issues[index];
    let mut body = String::new();
    if !sub.body.trim().is_empty() {
        body.push_str(sub.body.trim_end());
        body.push_str("\n\n---\n");
    }
    let _ = writeln!(body, "Part of {} ({})", parent.reference, parent.title);
    let deps: Vec<&str> = sub
        .depends_on
        .iter()
        .filter_map(|&d| created.get(d).and_then(|r| r.as_deref()))
        .collect();
    if !deps.is_empty() {
        let _ = writeln!(body, "Depends on: {}", deps.join(", "));
    }
    body
}

fn sibling_comment(plan: &DecompositionPlan, parent: &Issue, refs: &[String], index: usize) -> String {
    let mut out = format!("Sibling sub-issues of {}:\n", parent.reference);
    for (i, (sub, reference)) in plan.sub_issues.iter().zip(refs).enumerate() {
        if i != index {
            let _ = writeln!(out, "- {} {}", reference, sub.title);
        }
    }
    out
}

fn summary_comment(plan: &DecompositionPlan, refs: &[String]) -> String {
    let mut out = format!(
        "Decomposed into {} sub-issues (confidence {:.2}).\n",
        refs.len(),
        plan.confidence
    );
    if !plan.reasoning.trim().is_empty() {
        let _ = writeln!(out, "\n{}", plan.reasoning.trim());
    }
    out.push('\n');
    for (sub, reference) in plan.sub_issues.iter().zip(refs) {
        let _ = write!(out, "- {} {}", reference, sub.title);
        if !sub.depends_on.is_empty() {
            let deps: Vec<&str> = sub
                .depends_on
                .iter()
                .filter_map(|&d| refs.get(d).map(String::as_str))
                .collect();
            let _ = write!(out, " (after {})", deps.join(", "));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::types::SubIssueSpec;
    use crate::tracker::LocalTracker;
    use tempfile::tempdir;

    fn sub(title: &str, depends_on: Vec<usize>) -> SubIssueSpec {
        SubIssueSpec {
            title: title.to_string(),
            body: format!("Do {}", title),
            labels: vec!["sub".to_string()],
            depends_on,
        }
    }

    #[tokio::test]
    async fn test_materialize_in_dependency_order() {
        let dir = tempdir().unwrap();
        let tracker = LocalTracker::new(dir.path());
        let parent_ref = tracker
            .create_issue(&NewIssue {
                title: "Big feature".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let parent = tracker.get_issue(&parent_ref).await.unwrap();

        // api depends on schema; ui depends on api
        let plan = DecompositionPlan {
            decision: Decision::Decompose,
            confidence: 0.9,
            reasoning: "Layers are independent".to_string(),
            sub_issues: vec![sub("ui", vec![1]), sub("api", vec![2]), sub("schema", vec![])],
        };
        let refs = materialize(&plan, &parent, &tracker, 0).await.unwrap();

        // schema is created first (local#2), then api, then ui
        assert_eq!(refs, vec!["local#4", "local#3", "local#2"]);

        let ui = tracker.get_issue("local#4").await.unwrap();
        assert_eq!(ui.title, "ui");
        assert!(ui.body.starts_with("Do ui"));
        assert!(ui.body.contains("Part of local#1 (Big feature)"));
        assert!(ui.body.contains("Depends on: local#3"));
        assert_eq!(ui.labels, vec!["sub"]);

        let schema = tracker.get_issue("local#2").await.unwrap();
        assert!(!schema.body.contains("Depends on"));

        let stored = tracker.load(&parent_ref).unwrap();
        assert_eq!(stored.comments.len(), 1);
        let summary = &stored.comments[0].body;
        assert!(summary.contains("Decomposed into 3 sub-issues"));
        assert!(summary.contains("- local#4 ui (after local#3)"));

        // Every sub-issue links the other two
        let api = tracker.load("local#3").unwrap();
        assert_eq!(api.comments.len(), 1);
        let siblings = &api.comments[0].body;
        assert!(siblings.contains("Sibling sub-issues of local#1"));
        assert!(siblings.contains("- local#4 ui"));
        assert!(siblings.contains("- local#2 schema"));
        assert!(!siblings.contains("local#3"));
    }

    #[tokio::test]
    async fn test_resume_skips_created_sub_issues() {
        let dir = tempdir().unwrap();
        let tracker = LocalTracker::new(dir.path());
        let parent_ref = tracker
            .create_issue(&NewIssue {
                title: "Big feature".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let parent = tracker.get_issue(&parent_ref).await.unwrap();
        let plan = DecompositionPlan {
            decision: Decision::Decompose,
            confidence: 0.9,
            reasoning: String::new(),
            sub_issues: vec![sub("schema", vec![]), sub("api", vec![0])],
        };

        // schema made it before the interruption
        let schema_ref = tracker
            .create_issue(&NewIssue {
                title: "schema".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut progress = Vec::new();
        let refs = materialize_resuming(
            &plan,
            &parent,
            &tracker,
            0,
            vec![Some(schema_ref.clone())],
            |created| {
                progress.push(created.to_vec());
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(refs, vec![schema_ref.clone(), "local#3".to_string()]);
        assert_eq!(tracker.list().unwrap().len(), 3);
        assert_eq!(progress, vec![vec![Some(schema_ref.clone()), Some("local#3".to_string())]]);
        let api = tracker.get_issue("local#3").await.unwrap();
        assert!(api.body.contains(&format!("Depends on: {}", schema_ref)));
    }

    #[tokio::test]
    async fn test_atomic_plan_creates_nothing() {
        let dir = tempdir().unwrap();
        let tracker = LocalTracker::new(dir.path());
        let parent = Issue {
            reference: "local#1".to_string(),
            title: "small".to_string(),
            body: String::new(),
            labels: vec![],
        };
        let plan = DecompositionPlan {
            decision: Decision::Atomic,
            confidence: 0.9,
            reasoning: String::new(),
            sub_issues: vec![],
        };
        assert!(materialize(&plan, &parent, &tracker, 0).await.unwrap().is_empty());
        assert!(tracker.list().unwrap().is_empty());
    }
}
