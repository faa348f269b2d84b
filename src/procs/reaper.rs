//! Orphan reaper for leaked agent subprocesses
//!
//! Agent children can outlive the daemon when it crashes, and nothing else
//! on the host will ever clean them up. The reaper periodically enumerates
//! host processes whose command line carries the agent signature, skips
//! everything the tracker knows about, skips anything younger than
//! `max_age` (a healthy agent may legitimately run for many minutes), and
//! kills the rest politely-then-forcefully.
//!
//! Enumeration is per-family: `ps -eo pid=,etime=,args=` where available,
//! a PowerShell CIM query on the Windows family.

use super::{terminate_pid, ProcessTracker};
use crate::workers::CompletionSignal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for the orphan reaper
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan the host
    pub scan_interval: Duration,
    /// Processes younger than this are never touched
    pub max_age: Duration,
    /// Command-line substring identifying agent subprocesses
    pub pattern: String,
    /// Grace period between the polite and the forceful signal
    pub graceful_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(30 * 60),
            pattern: "claude-mem-agent".to_string(),
            graceful_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub found: usize,
    pub killed: usize,
    pub failed: usize,
}

/// Cumulative totals across all scans
#[derive(Debug, Default)]
struct ReaperMetrics {
    scans: AtomicU64,
    found: AtomicU64,
    killed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of reaper totals for the stats endpoint
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReaperTotals {
    pub scans: u64,
    pub found: u64,
    pub killed: u64,
    pub failed: u64,
}

enum ReaperCommand {
    #[allow(dead_code)] // Constructed by trigger_scan
    Scan,
    Shutdown,
}

/// A process found during host enumeration
#[derive(Debug, Clone)]
struct Candidate {
    pid: u32,
    age: Duration,
    command: String,
}

/// Background orphan reaper thread
pub struct OrphanReaper {
    tx: SyncSender<ReaperCommand>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<CompletionSignal>,
    metrics: Arc<ReaperMetrics>,
}

impl OrphanReaper {
    pub fn start(config: ReaperConfig, tracker: Arc<ProcessTracker>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<ReaperCommand>(4);

        let metrics = Arc::new(ReaperMetrics::default());
        let thread_metrics = metrics.clone();

        let completion = Arc::new(CompletionSignal::new());
        let thread_completion = completion.clone();

        let handle = thread::Builder::new()
            .name("orphan-reaper".into())
            .spawn(move || {
                Self::reaper_thread(rx, config, tracker, thread_metrics);
                thread_completion.complete();
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
            completion,
            metrics,
        })
    }

    /// Cumulative scan totals.
    pub fn totals(&self) -> ReaperTotals {
        ReaperTotals {
            scans: self.metrics.scans.load(Ordering::Relaxed),
            found: self.metrics.found.load(Ordering::Relaxed),
            killed: self.metrics.killed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
        }
    }

    /// Trigger a scan ahead of schedule.
    #[allow(dead_code)] // Reserved for an admin endpoint
    pub fn trigger_scan(&self) {
        let _ = self.tx.try_send(ReaperCommand::Scan);
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(ReaperCommand::Shutdown);

        const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
        if !self.completion.wait(SHUTDOWN_TIMEOUT) {
            tracing::warn!("Orphan reaper did not complete within {:?}", SHUTDOWN_TIMEOUT);
            anyhow::bail!("Shutdown timeout");
        }
        Ok(())
    }

    fn reaper_thread(
        rx: mpsc::Receiver<ReaperCommand>,
        config: ReaperConfig,
        tracker: Arc<ProcessTracker>,
        metrics: Arc<ReaperMetrics>,
    ) {
        tracing::info!(
            interval_secs = config.scan_interval.as_secs(),
            max_age_secs = config.max_age.as_secs(),
            pattern = %config.pattern,
            "Orphan reaper started"
        );

        loop {
            match rx.recv_timeout(config.scan_interval) {
                Ok(ReaperCommand::Scan) | Err(RecvTimeoutError::Timeout) => {
                    let outcome = scan(&config, &tracker);
                    metrics.scans.fetch_add(1, Ordering::Relaxed);
                    metrics.found.fetch_add(outcome.found as u64, Ordering::Relaxed);
                    metrics
                        .killed
                        .fetch_add(outcome.killed as u64, Ordering::Relaxed);
                    metrics
                        .failed
                        .fetch_add(outcome.failed as u64, Ordering::Relaxed);

                    if outcome.found > 0 {
                        tracing::info!(
                            found = outcome.found,
                            killed = outcome.killed,
                            failed = outcome.failed,
                            "Orphan scan complete"
                        );
                    }
                }
                Ok(ReaperCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Orphan reaper received shutdown");
                    break;
                }
            }
        }
    }
}

impl Drop for OrphanReaper {
    fn drop(&mut self) {
        let _ = self.tx.send(ReaperCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One reaper pass: enumerate, filter, kill.
fn scan(config: &ReaperConfig, tracker: &ProcessTracker) -> ScanOutcome {
    let candidates = match list_agent_processes(&config.pattern) {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!("Process enumeration failed: {}", e);
            return ScanOutcome::default();
        }
    };

    let tracked = tracker.tracked_pids();
    let own_pid = std::process::id();

    let orphans: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.pid != own_pid)
        .filter(|c| !tracked.contains(&c.pid))
        .filter(|c| c.age >= config.max_age)
        .collect();

    let mut outcome = ScanOutcome {
        found: orphans.len(),
        ..Default::default()
    };

    for orphan in orphans {
        tracing::warn!(
            pid = orphan.pid,
            age_secs = orphan.age.as_secs(),
            command = %orphan.command,
            "Killing orphaned agent process"
        );
        if terminate_pid(orphan.pid, config.graceful_timeout) {
            outcome.killed += 1;
        } else {
            outcome.failed += 1;
        }
    }

    outcome
}

/// Parse the `ps` composite elapsed-time format `[[DD-]HH:]MM:SS`.
fn parse_etime(etime: &str) -> Option<Duration> {
    let etime = etime.trim();
    if etime.is_empty() {
        return None;
    }

    let (days, clock) = match etime.split_once('-') {
        Some((days, rest)) => (days.parse::<u64>().ok()?, rest),
        None => (0, etime),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (
            h.parse::<u64>().ok()?,
            m.parse::<u64>().ok()?,
            s.parse::<u64>().ok()?,
        ),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        _ => return None,
    };

    Some(Duration::from_secs(
        days * 86_400 + hours * 3_600 + minutes * 60 + seconds,
    ))
}

/// Enumerate host processes whose command line contains `pattern` (unix).
#[cfg(unix)]
fn list_agent_processes(pattern: &str) -> std::io::Result<Vec<Candidate>> {
    let output = std::process::Command::new("ps")
        .args(["-eo", "pid=,etime=,args="])
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut candidates = Vec::new();

    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(etime)) = (fields.next(), fields.next()) else {
            continue;
        };
        let command = fields.collect::<Vec<_>>().join(" ");
        if !command.contains(pattern) {
            continue;
        }
        let Ok(pid) = pid.parse::<u32>() else {
            continue;
        };
        let Some(age) = parse_etime(etime) else {
            continue;
        };
        candidates.push(Candidate { pid, age, command });
    }

    Ok(candidates)
}

/// Enumerate host processes whose command line contains `pattern` (windows).
#[cfg(windows)]
fn list_agent_processes(pattern: &str) -> std::io::Result<Vec<Candidate>> {
    // CIM gives creation time directly; emit tab-separated pid/age/cmdline
    let script = "Get-CimInstance Win32_Process | ForEach-Object { \
                  $age = [int]((Get-Date) - $_.CreationDate).TotalSeconds; \
                  \"$($_.ProcessId)`t$age`t$($_.CommandLine)\" }";
    let output = std::process::Command::new("powershell")
        .args(["-NoProfile", "-Command", script])
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut candidates = Vec::new();

    for line in stdout.lines() {
        let mut fields = line.splitn(3, '\t');
        let (Some(pid), Some(age), Some(command)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !command.contains(pattern) {
            continue;
        }
        let (Ok(pid), Ok(age_secs)) = (pid.parse::<u32>(), age.parse::<u64>()) else {
            continue;
        };
        candidates.push(Candidate {
            pid,
            age: Duration::from_secs(age_secs),
            command: command.to_string(),
        });
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_etime_minutes_seconds() {
        assert_eq!(parse_etime("05:30"), Some(Duration::from_secs(330)));
        assert_eq!(parse_etime("00:00"), Some(Duration::from_secs(0)));
    }

    #[test]
    fn test_parse_etime_with_hours() {
        assert_eq!(parse_etime("02:05:30"), Some(Duration::from_secs(7530)));
    }

    #[test]
    fn test_parse_etime_with_days() {
        // 1 day, 2 hours, 3 minutes, 4 seconds
        assert_eq!(
            parse_etime("1-02:03:04"),
            Some(Duration::from_secs(86_400 + 7_200 + 180 + 4))
        );
    }

    #[test]
    fn test_parse_etime_rejects_garbage() {
        assert_eq!(parse_etime(""), None);
        assert_eq!(parse_etime("abc"), None);
        assert_eq!(parse_etime("1:2:3:4"), None);
    }

    #[cfg(unix)]
    mod unix_scan {
        use super::super::*;
        use std::io::Read;
        use std::process::{Command, Stdio};

        /// Spawn a long sleep detached from this process (via an
        /// intermediate shell) so a kill makes it disappear entirely
        /// instead of lingering as our zombie child.
        fn spawn_detached_sleeper(seconds: u64) -> u32 {
            let mut shell = Command::new("sh")
                .arg("-c")
                .arg(format!("sleep {} >/dev/null 2>&1 & echo $!", seconds))
                .stdout(Stdio::piped())
                .spawn()
                .expect("spawn shell");
            let mut out = String::new();
            shell
                .stdout
                .take()
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            shell.wait().unwrap();
            out.trim().parse().expect("pid from shell")
        }

        #[test]
        fn test_scan_kills_untracked_orphan_but_spares_tracked() {
            // Unique sleep duration doubles as the agent signature
            let marker_secs = 86_200 + (std::process::id() % 100) as u64;
            let pattern = format!("sleep {}", marker_secs);

            // Orphan: detached, unknown to the tracker
            let orphan_pid = spawn_detached_sleeper(marker_secs);

            // Healthy agent: same signature, registered with the tracker
            let tracker = ProcessTracker::new();
            let tracked_child = Command::new("sleep")
                .arg(marker_secs.to_string())
                .spawn()
                .expect("spawn tracked sleep");
            let tracked_pid = tracked_child.id();
            tracker.register(1, tracked_child, pattern.clone());

            let config = ReaperConfig {
                max_age: Duration::from_secs(0), // everything is "old enough"
                graceful_timeout: Duration::from_secs(2),
                pattern,
                ..Default::default()
            };

            let outcome = scan(&config, &tracker);

            assert_eq!(outcome.found, 1);
            assert_eq!(outcome.killed, 1);
            assert_eq!(outcome.failed, 0);
            assert!(!crate::procs::pid_alive(orphan_pid));

            // The registered agent survived the scan
            assert_eq!(tracker.tracked_pids(), vec![tracked_pid]);
            assert!(tracker.terminate(1, Duration::from_secs(2)));
        }

        #[test]
        fn test_scan_respects_max_age() {
            let marker_secs = 86_100 + (std::process::id() % 100) as u64;
            let pattern = format!("sleep {}", marker_secs);
            let orphan_pid = spawn_detached_sleeper(marker_secs);

            let tracker = ProcessTracker::new();
            let config = ReaperConfig {
                max_age: Duration::from_secs(30 * 60),
                graceful_timeout: Duration::from_secs(1),
                pattern,
                ..Default::default()
            };

            // The freshly spawned process is far below max_age
            let outcome = scan(&config, &tracker);
            assert_eq!(outcome.found, 0);
            assert!(crate::procs::pid_alive(orphan_pid));

            // Clean up manually
            assert!(terminate_pid(orphan_pid, Duration::from_secs(2)));
        }
    }
}
