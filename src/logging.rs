//! Tracing setup for the binary.
//!
//! Two layers share one `EnvFilter`:
//! - compact, human-oriented output on stderr
//! - daily-rolling JSON lines under `.conveyor/logs/` for post-mortems
//!
//! `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` with
//! `--verbose`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "conveyor.log";

/// Default filter directive when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as `main`. When `log_dir` is `None` (or cannot be created) only the stderr
/// layer is installed.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        Some(tracing_appender::non_blocking(appender))
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().json().with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert_eq!(default_directive(true), "debug");
    }
}
