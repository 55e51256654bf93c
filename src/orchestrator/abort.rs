//! Cancellation: signals inside the running process, and operator aborts
//! delivered to another process by pid.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cancel `token` on SIGINT or SIGTERM. The in-flight subprocess is killed by
/// whoever is awaiting it, and the run unwinds to its abort path.
pub fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("signal received; cancelling workflow");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler; only Ctrl+C will cancel");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Whether `pid` names a live process. EPERM means it exists but belongs to
/// someone else.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 probes without delivering anything
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0
        || matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::EPERM
        )
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Ask the owning process to stop. Returns whether a signal was sent.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    if pid == std::process::id() || !process_alive(pid) {
        debug!(pid, "owner not running; nothing to signal");
        return false;
    }
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to signal workflow owner");
    }
    rc == 0
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> bool {
    false
}
