//! Background summarization workers
//!
//! Two long-running loops drain the durable queue:
//!
//! ```text
//! raw_tool_events ──▶ EventWorker ──▶ observations
//! raw_summary_requests ──▶ SummaryWorker ──▶ summaries
//! ```
//!
//! Each worker is a dedicated OS thread driven by `recv_timeout` on a small
//! command channel: a timeout is a tick, an explicit command is an early
//! tick or shutdown. Because one thread owns the whole loop, ticks are
//! strictly serialized - a tick that overruns the interval delays the next
//! one instead of stacking up.

mod events;
mod prompt;
mod summaries;

pub use events::{EventWorker, EventWorkerSettings};
pub use prompt::Mode;
pub use summaries::{SummaryWorker, SummaryWorkerSettings};

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Commands accepted by a worker thread
pub(crate) enum WorkerCommand {
    /// Run a tick now instead of waiting out the interval
    #[allow(dead_code)] // Constructed by trigger_tick
    Tick,
    /// Stop the loop after the current tick
    Shutdown,
}

/// One-shot completion flag for graceful shutdown.
///
/// The worker thread flips it when the loop exits; `shutdown()` waits on it
/// with a bounded timeout so a hung LLM call cannot wedge process exit
/// forever.
pub struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Mark complete and wake all waiters.
    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    /// Wait up to `timeout` for completion. Returns whether it completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap();
        if *done {
            return true;
        }
        let (done, result) = self
            .condvar
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap();
        drop(done);
        !result.timed_out()
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fakes for worker tests: a scripted LLM and an in-memory
    //! session store.

    use crate::llm::{Completion, CompletionClient, CompletionRequest, LlmError};
    use crate::memory::{
        Observation, RecentObservation, SessionRecord, SessionStore, SessionSummary, StoredBatch,
    };
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    /// Completion client that replays a scripted sequence of outcomes.
    /// Once the script runs dry it returns empty completions.
    pub struct FakeLlm {
        script: Mutex<VecDeque<Result<Completion, LlmError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeLlm {
        pub fn new() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn push_content(&self, content: &str) {
            self.script.lock().unwrap().push_back(Ok(Completion {
                content: content.to_string(),
                total_tokens: 42,
            }));
        }

        pub fn push_error(&self, error: LlmError) {
            self.script.lock().unwrap().push_back(Err(error));
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CompletionClient for FakeLlm {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.lock().unwrap().push(request.prompt.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(Completion {
                        content: String::new(),
                        total_tokens: 0,
                    })
                })
        }
    }

    /// In-memory session store with an optional injected storage fault.
    pub struct FakeStore {
        sessions: Mutex<HashMap<i64, SessionRecord>>,
        pub observations: Mutex<Vec<Observation>>,
        pub summaries: Mutex<Vec<SessionSummary>>,
        pub recent: Mutex<Vec<RecentObservation>>,
        next_id: AtomicI64,
        pub fail_store: Mutex<bool>,
        pub fail_recent: Mutex<bool>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self {
                sessions: Mutex::new(HashMap::new()),
                observations: Mutex::new(Vec::new()),
                summaries: Mutex::new(Vec::new()),
                recent: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(1),
                fail_store: Mutex::new(false),
                fail_recent: Mutex::new(false),
            }
        }

        pub fn add_session(&self, id: i64, memory_session_id: Option<&str>, project: Option<&str>) {
            self.sessions.lock().unwrap().insert(
                id,
                SessionRecord {
                    id,
                    content_session_id: format!("content-{}", id),
                    memory_session_id: memory_session_id.map(String::from),
                    project: project.map(String::from),
                },
            );
        }
    }

    impl SessionStore for FakeStore {
        fn get_session_by_id(&self, session_db_id: i64) -> anyhow::Result<Option<SessionRecord>> {
            Ok(self.sessions.lock().unwrap().get(&session_db_id).cloned())
        }

        fn store_observations(
            &self,
            _memory_session_id: &str,
            _project: Option<&str>,
            observations: &[Observation],
            summary: Option<&SessionSummary>,
            _prompt_number: Option<i64>,
            _discovery_tokens: i64,
        ) -> anyhow::Result<StoredBatch> {
            if *self.fail_store.lock().unwrap() {
                anyhow::bail!("injected storage failure");
            }

            let mut batch = StoredBatch::default();
            let mut stored = self.observations.lock().unwrap();
            for obs in observations {
                stored.push(obs.clone());
                batch
                    .observation_ids
                    .push(self.next_id.fetch_add(1, Ordering::SeqCst));
            }
            if let Some(summary) = summary {
                self.summaries.lock().unwrap().push(summary.clone());
                batch.summary_id = Some(self.next_id.fetch_add(1, Ordering::SeqCst));
            }
            Ok(batch)
        }

        fn get_recent_observations(
            &self,
            _project: &str,
            limit: usize,
        ) -> anyhow::Result<Vec<RecentObservation>> {
            if *self.fail_recent.lock().unwrap() {
                anyhow::bail!("injected recent-observation failure");
            }
            Ok(self
                .recent
                .lock()
                .unwrap()
                .iter()
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_completion_signal_wait() {
        use super::CompletionSignal;
        use std::sync::Arc;
        use std::time::Duration;

        let signal = Arc::new(CompletionSignal::new());
        assert!(!signal.wait(Duration::from_millis(10)));

        let signal2 = signal.clone();
        std::thread::spawn(move || signal2.complete());
        assert!(signal.wait(Duration::from_secs(2)));
        // Completed signals stay completed
        assert!(signal.wait(Duration::from_millis(1)));
    }
}
