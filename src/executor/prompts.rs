//! Prompts for the agent-driven phases.

use std::path::Path;

use crate::phase::Phase;
use crate::router::{Failure, ToolKind};
use crate::tracker::Issue;

const REPORT_FORMAT: &str = r#"Finish your reply with exactly one JSON object of this shape and nothing after it:

```json
{"failures": [{"file": "src/lib.rs", "line": 12, "rule_or_message": "what is wrong"}]}
```

Use an empty list when there is nothing to report. `file` and `line` may be null."#;

fn issue_section(issue: &Issue) -> String {
    format!(
        "## Issue {}\nTitle: {}\n\n{}\n",
        issue.reference,
        issue.title,
        issue.body.trim()
    )
}

pub fn plan_prompt(issue: &Issue, plan_file: &Path) -> String {
    format!(
        r#"You are planning the implementation of an issue in this repository.

{issue}
## TASK
Study the code and write an implementation plan to `{plan}`:
- the files to change and why
- new types or functions, with signatures
- the tests that will prove the change works

Do not change any other file yet."#,
        issue = issue_section(issue),
        plan = plan_file.display(),
    )
}

pub fn implement_prompt(issue: &Issue, plan_file: Option<&Path>) -> String {
    let plan = match plan_file {
        Some(path) => format!("Follow the plan in `{}`.", path.display()),
        None => "No plan was recorded; keep the change minimal.".to_string(),
    };
    format!(
        r#"You are implementing an issue in this repository.

{issue}
## TASK
{plan}
Write the code and the tests. Keep unrelated code untouched."#,
        issue = issue_section(issue),
    )
}

pub fn check_prompt(kind: ToolKind) -> String {
    let what = match kind {
        ToolKind::Build => "Build the project and report every compile error.",
        ToolKind::Lint => "Run the project's linters and report every violation.",
        ToolKind::Test => "Run the project's test suite and report every failing test.",
    };
    format!(
        "You are running the {kind} check for this workspace. Do not modify any file.\n\n{what}\n\n{REPORT_FORMAT}"
    )
}

pub fn review_prompt(issue: &Issue, diff: &str) -> String {
    format!(
        r#"You are reviewing a change made for an issue.

{issue}
## DIFF
```diff
{diff}
```

## TASK
Report defects that must be fixed before this ships: bugs, missing tests, behavior that
does not match the issue. Style preferences are not defects. Do not modify any file.

{format}"#,
        issue = issue_section(issue),
        diff = diff.trim_end(),
        format = REPORT_FORMAT,
    )
}

pub fn document_prompt(issue: &Issue) -> String {
    format!(
        r#"You are updating documentation for a change that has been implemented and reviewed.

{issue}
## TASK
Update the README, doc comments and changelog where the change affects them.
Do not change behavior."#,
        issue = issue_section(issue),
    )
}

pub fn repair_prompt(phase: Phase, failures: &[Failure]) -> String {
    let list: Vec<String> = failures.iter().map(|f| format!("- {}", f)).collect();
    format!(
        r#"The {phase} phase reported these failures:

{list}

## TASK
Fix the causes of these failures. Change only what is needed."#,
        list = list.join("\n"),
    )
}
