//! Process supervision for LLM-agent subprocesses
//!
//! Split in two layers on purpose:
//!
//! - [`ProcessTracker`] handles the happy path: children we spawned and
//!   own, terminated through their handles when their session ends.
//! - [`OrphanReaper`] handles the unhappy path: agent processes that
//!   outlived a crashed parent, found by scanning the host and killed only
//!   past a coarse age threshold.
//!
//! Keeping them separate means the hot-path registry never depends on an
//! OS enumeration scan.

mod reaper;
mod tracker;

pub use reaper::{OrphanReaper, ReaperConfig, ReaperTotals, ScanOutcome};
pub use tracker::{ProcessTracker, TerminateSummary};

use std::time::Duration;

/// Extra wait after the force-kill signal before declaring failure
pub(crate) const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Poll step while waiting for a process to die
pub(crate) const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ─────────────────────────────────────────────────────────────────────────────
// Signal helpers (unix)
// ─────────────────────────────────────────────────────────────────────────────

/// Send the polite termination signal (SIGTERM).
#[cfg(unix)]
pub(crate) fn signal_terminate(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

/// Send the force-kill signal (SIGKILL).
#[cfg(unix)]
pub(crate) fn signal_kill(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        // ESRCH means the process is already gone, which is what we wanted
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Zero-impact liveness probe via signal 0.
///
/// Only meaningful for processes we did not parent: a zombie child still
/// answers the probe until someone waits on it, so owned children are
/// checked through `Child::try_wait` instead.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: exists but owned by someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal helpers (windows)
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(windows)]
pub(crate) fn signal_terminate(pid: u32) -> std::io::Result<()> {
    // taskkill without /F asks the process to exit
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output()
        .map(|_| ())
}

#[cfg(windows)]
pub(crate) fn signal_kill(pid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
        .map(|_| ())
}

#[cfg(windows)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Polite-then-forceful termination of a process we do not hold a handle
/// for. Returns whether the pid is gone afterwards.
pub(crate) fn terminate_pid(pid: u32, graceful_timeout: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }

    if let Err(e) = signal_terminate(pid) {
        tracing::warn!(pid, "Failed to send termination signal: {}", e);
    }
    if wait_for_death(pid, graceful_timeout) {
        return true;
    }

    tracing::warn!(pid, "Process ignored polite termination, force killing");
    if let Err(e) = signal_kill(pid) {
        tracing::warn!(pid, "Failed to send kill signal: {}", e);
    }
    wait_for_death(pid, FORCE_KILL_WAIT)
}

fn wait_for_death(pid: u32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(DEATH_POLL_INTERVAL);
    }
}
