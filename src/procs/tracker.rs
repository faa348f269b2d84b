//! In-process registry of spawned agent subprocesses
//!
//! One tracker per service instance, never persisted. Owns the child
//! handles, so death checks go through `try_wait` (which also reaps the
//! zombie) rather than the signal-0 probe.

use super::{signal_terminate, DEATH_POLL_INTERVAL, FORCE_KILL_WAIT};
use std::collections::HashMap;
use std::process::Child;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TrackedEntry {
    child: Child,
    pid: u32,
    spawned_at: Instant,
    command: String,
}

/// Result of a bulk shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminateSummary {
    pub terminated: usize,
    pub failed: usize,
}

/// Registry of agent child processes, keyed by session database id
#[derive(Default)]
pub struct ProcessTracker {
    entries: Mutex<HashMap<i64, TrackedEntry>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned child. Idempotent overwrite: a session gets
    /// at most one agent, so re-registering replaces (and drops) the old
    /// entry.
    pub fn register(&self, session_db_id: i64, child: Child, command: impl Into<String>) {
        let pid = child.id();
        let command = command.into();

        let mut entries = self.entries.lock().unwrap();
        if let Some(previous) = entries.insert(
            session_db_id,
            TrackedEntry {
                child,
                pid,
                spawned_at: Instant::now(),
                command,
            },
        ) {
            tracing::warn!(
                session_db_id,
                old_pid = previous.pid,
                new_pid = pid,
                "Replaced tracked agent process"
            );
        } else {
            tracing::debug!(session_db_id, pid, "Tracking agent process");
        }
    }

    /// Terminate the tracked process for a session: polite signal, wait up
    /// to `graceful_timeout`, force kill, short wait, verify. Returns true
    /// when the pid is gone afterwards - including the case where nothing
    /// was tracked for the session. On failure the entry is retained so a
    /// later attempt can retry.
    pub fn terminate(&self, session_db_id: i64, graceful_timeout: Duration) -> bool {
        let Some(mut entry) = self.entries.lock().unwrap().remove(&session_db_id) else {
            return true;
        };

        tracing::info!(
            session_db_id,
            pid = entry.pid,
            command = %entry.command,
            "Terminating agent process"
        );

        if let Err(e) = signal_terminate(entry.pid) {
            tracing::warn!(pid = entry.pid, "Failed to send termination signal: {}", e);
        }
        if Self::wait_for_exit(&mut entry.child, graceful_timeout) {
            return true;
        }

        tracing::warn!(
            pid = entry.pid,
            "Agent ignored polite termination, force killing"
        );
        if let Err(e) = entry.child.kill() {
            tracing::warn!(pid = entry.pid, "Force kill failed: {}", e);
        }
        if Self::wait_for_exit(&mut entry.child, FORCE_KILL_WAIT) {
            return true;
        }

        // Still alive: keep tracking it rather than leaking it
        tracing::error!(pid = entry.pid, "Agent process survived force kill");
        self.entries.lock().unwrap().insert(session_db_id, entry);
        false
    }

    /// Best-effort bulk shutdown, invoked on service stop.
    pub fn terminate_all(&self, graceful_timeout: Duration) -> TerminateSummary {
        let session_ids: Vec<i64> = self.entries.lock().unwrap().keys().copied().collect();

        let mut summary = TerminateSummary::default();
        for session_db_id in session_ids {
            if self.terminate(session_db_id, graceful_timeout) {
                summary.terminated += 1;
            } else {
                summary.failed += 1;
            }
        }
        if summary.terminated + summary.failed > 0 {
            tracing::info!(
                terminated = summary.terminated,
                failed = summary.failed,
                "Tracker shutdown complete"
            );
        }
        summary
    }

    /// OS probe for processes we never parented; "no such process" counts
    /// as dead.
    #[allow(dead_code)] // Part of the supervision contract, exercised in tests
    pub fn verify_dead(pid: u32) -> bool {
        !super::pid_alive(pid)
    }

    /// Remove entries whose process already exited. Called opportunistically
    /// before reads so exit notifications retire their records.
    pub fn reap_exited(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|session_db_id, entry| match entry.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(
                    session_db_id,
                    pid = entry.pid,
                    %status,
                    "Agent process exited, removing from tracker"
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = entry.pid, "try_wait failed: {}", e);
                true
            }
        });
    }

    /// Pids currently tracked (after reaping exited entries). The orphan
    /// reaper excludes these from its kill list.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.reap_exited();
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.pid)
            .collect()
    }

    /// Number of live tracked processes.
    pub fn len(&self) -> usize {
        self.reap_exited();
        self.entries.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the oldest tracked process, if any.
    #[allow(dead_code)] // Diagnostics
    pub fn oldest_age(&self) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.spawned_at.elapsed())
            .max()
    }

    fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                // Treat wait errors as "already reaped elsewhere"
                Err(_) => return true,
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DEATH_POLL_INTERVAL);
        }
    }
}
