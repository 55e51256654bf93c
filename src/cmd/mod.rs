//! CLI command implementations.
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `run`    | `Run`, `Analyze`                    |
//! | `status` | `Status`, `Abort`, `Release`, `Leases` |
//! | `issue`  | `Issue`                             |
//! | `config` | `Config`                            |

pub mod config;
pub mod issue;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use issue::cmd_issue;
pub use run::{cmd_analyze, cmd_run};
pub use status::{cmd_abort, cmd_leases, cmd_release, cmd_status};

use anyhow::Result;
use std::path::Path;

use conveyor::config::Config;

/// Load `conveyor.toml` and make sure the `.conveyor` layout exists.
pub(crate) fn load_config(project_dir: &Path, verbose: bool) -> Result<Config> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    for warning in config.toml.validate() {
        tracing::warn!("config: {}", warning);
    }
    config.ensure_directories()?;
    Ok(config)
}
