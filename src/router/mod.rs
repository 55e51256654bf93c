//! Out-of-process deterministic checks (build, lint, test).
//!
//! A configured checker runs as a subprocess inside the workflow's
//! workspace and reports its findings as one JSON object on stdout:
//!
//! ```json
//! {"failures": [{"file": "src/lib.rs", "line": 12, "rule_or_message": "unused import"}]}
//! ```
//!
//! Only that structured list travels downstream; raw logs never do.

pub mod result;
pub mod runner;

pub use result::{Failure, RouteOutcome, ToolReport, ToolResult, parse_tool_output};
pub use runner::{ExternalToolRouter, RouterSettings};

use serde::{Deserialize, Serialize};

/// A deterministic checker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Build,
    Lint,
    Test,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Build, ToolKind::Lint, ToolKind::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Build => "build",
            ToolKind::Lint => "lint",
            ToolKind::Test => "test",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
