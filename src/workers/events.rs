//! Event summarizer worker
//!
//! Polls the tool-event queue, claims a batch, groups it by session,
//! summarizes each group with one LLM call and materializes the parsed
//! observations into the memory store.
//!
//! # Failure taxonomy
//!
//! LLM and materialization failures (missing session, dead upstream,
//! timeout) are transient from the queue's point of view: every event in
//! the affected group goes through `mark_event_failed` and the retry budget
//! decides its fate. Storage failures abort the whole tick instead - the
//! claimed rows stay in `summarizing` and the stall release recovers them,
//! which avoids double-counting a retry the event never really got.

use super::{prompt, CompletionSignal, Mode, WorkerCommand};
use crate::llm::{CompletionClient, CompletionRequest, MAX_TOKENS_EVENTS};
use crate::memory::SessionStore;
use crate::parser;
use crate::queue::{EventQueue, RawToolEvent};
use crate::util::now_epoch_ms;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tuning knobs for the event worker
#[derive(Debug, Clone)]
pub struct EventWorkerSettings {
    /// How often a tick fires
    pub tick_interval: Duration,
    /// Maximum events claimed per tick
    pub batch_size: usize,
    /// Run completed-row GC every Nth tick
    pub gc_every_ticks: u64,
    /// Run the stall release every Mth tick
    pub release_every_ticks: u64,
    /// Age at which a `summarizing` row counts as stalled
    pub stall_threshold: Duration,
    /// Completed rows older than this are deleted
    pub retention: Duration,
}

impl Default for EventWorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10_000),
            batch_size: 10,
            gc_every_ticks: 100,
            release_every_ticks: 30,
            stall_threshold: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Handle to the running event worker thread
pub struct EventWorker {
    tx: SyncSender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<CompletionSignal>,
}

impl EventWorker {
    /// Spawn the worker thread. Releases every stuck claim on startup
    /// before the first tick (crash recovery with threshold 0).
    pub fn start(
        settings: EventWorkerSettings,
        queue: Arc<EventQueue>,
        store: Arc<dyn SessionStore>,
        llm: Arc<dyn CompletionClient>,
        mode: Mode,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WorkerCommand>(10);

        let completion = Arc::new(CompletionSignal::new());
        let thread_completion = completion.clone();

        let handle = thread::Builder::new()
            .name("event-summarizer".into())
            .spawn(move || {
                let mut summarizer = EventSummarizer {
                    settings,
                    queue,
                    store,
                    llm,
                    mode,
                    ticks: 0,
                };
                summarizer.run(rx);
                thread_completion.complete();
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
            completion,
        })
    }

    /// Request a tick ahead of schedule.
    #[allow(dead_code)] // Reserved for intake-burst nudging
    pub fn trigger_tick(&self) {
        let _ = self.tx.try_send(WorkerCommand::Tick);
    }

    /// Stop the loop. A tick in progress completes first; a live LLM call
    /// runs out its deadline, so the wait is bounded accordingly.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(WorkerCommand::Shutdown);

        let timeout = crate::llm::REQUEST_TIMEOUT + Duration::from_secs(5);
        if !self.completion.wait(timeout) {
            tracing::warn!("Event worker did not complete within {:?}", timeout);
            anyhow::bail!("Shutdown timeout");
        }
        tracing::debug!("Event worker shutdown complete");
        Ok(())
    }
}

impl Drop for EventWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The worker loop state, separated from the thread handle so ticks can be
/// driven directly in tests.
pub(crate) struct EventSummarizer {
    pub(crate) settings: EventWorkerSettings,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) llm: Arc<dyn CompletionClient>,
    pub(crate) mode: Mode,
    pub(crate) ticks: u64,
}

impl EventSummarizer {
    fn run(&mut self, rx: mpsc::Receiver<WorkerCommand>) {
        // Crash recovery: anything still claimed belongs to a previous run
        match self.queue.release_stuck_events(0) {
            Ok(0) => {}
            Ok(released) => {
                tracing::info!(released, "Released stale event claims from previous run")
            }
            Err(e) => tracing::error!("Failed to release stale event claims: {}", e),
        }

        tracing::info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            llm = self.llm.name(),
            mode = %self.mode.name,
            "Event worker started"
        );

        loop {
            match rx.recv_timeout(self.settings.tick_interval) {
                Ok(WorkerCommand::Tick) | Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.run_tick() {
                        // Claimed rows stay in `summarizing`; the stall
                        // release puts them back
                        tracing::error!("Event tick aborted: {}", e);
                    }
                }
                Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Event worker received shutdown");
                    break;
                }
            }
        }
    }

    /// One tick: housekeeping cadences, claim, process per-session groups.
    pub(crate) fn run_tick(&mut self) -> anyhow::Result<()> {
        self.ticks += 1;

        if self.ticks % self.settings.gc_every_ticks == 0 {
            let cutoff = now_epoch_ms() - self.settings.retention.as_millis() as i64;
            match self.queue.delete_completed_events(cutoff) {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(deleted, "Deleted expired completed events"),
                Err(e) => tracing::warn!("Completed-event cleanup failed: {}", e),
            }
        }

        if self.ticks % self.settings.release_every_ticks == 0 {
            match self
                .queue
                .release_stuck_events(self.settings.stall_threshold.as_millis() as i64)
            {
                Ok(0) => {}
                Ok(released) => tracing::warn!(released, "Released stalled event claims"),
                Err(e) => tracing::warn!("Stall release failed: {}", e),
            }
        }

        let claimed = self.queue.claim_events(self.settings.batch_size)?;
        if claimed.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = claimed.len(), "Claimed events for summarization");

        // Group by session, preserving claim order within each group. LLM
        // context must be coherent; cross-session observations are
        // meaningless.
        let mut groups: Vec<(i64, Vec<RawToolEvent>)> = Vec::new();
        for event in claimed {
            match groups.iter_mut().find(|(sid, _)| *sid == event.session_db_id) {
                Some((_, events)) => events.push(event),
                None => groups.push((event.session_db_id, vec![event])),
            }
        }

        for (session_db_id, events) in groups {
            self.process_session_events(session_db_id, events)?;
        }

        Ok(())
    }

    /// Summarize one per-session group. Returns `Err` only for storage
    /// failures; LLM and materialization failures are recorded on the rows.
    fn process_session_events(
        &self,
        session_db_id: i64,
        events: Vec<RawToolEvent>,
    ) -> anyhow::Result<()> {
        let session = self.store.get_session_by_id(session_db_id)?;

        let Some(session) = session else {
            let message = format!("Session {} not found", session_db_id);
            return self.fail_group(&events, &message);
        };
        let Some(memory_session_id) = session.memory_session_id.clone() else {
            let message = format!("Session {} has no memory session id", session_db_id);
            return self.fail_group(&events, &message);
        };

        let request = CompletionRequest::new(
            prompt::build_event_prompt(&self.mode, &events),
            MAX_TOKENS_EVENTS,
        );
        let completion = match self.llm.complete(&request) {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(
                    session_db_id,
                    events = events.len(),
                    "LLM call failed: {}",
                    e
                );
                return self.fail_group(&events, &e.to_string());
            }
        };

        let observations =
            parser::parse_observations(&completion.content, &events[0].content_session_id);

        // An empty parse is a valid outcome: the model judged nothing worth
        // remembering. Complete with the sentinel id.
        if observations.is_empty() {
            for event in &events {
                self.queue.mark_event_completed(event.id, 0)?;
            }
            tracing::debug!(session_db_id, "No observations extracted, events completed");
            return Ok(());
        }

        let project = session
            .project
            .as_deref()
            .or(events[0].project.as_deref());
        let prompt_number = events.iter().filter_map(|e| e.prompt_number).max();

        let stored = self.store.store_observations(
            &memory_session_id,
            project,
            &observations,
            None,
            prompt_number,
            completion.total_tokens,
        )?;

        // Events outnumbering observations reuse the last id: several events
        // often compress into one observation, and the link on a completed
        // row is informational only.
        let last_id = stored.observation_ids.last().copied().unwrap_or(0);
        for (index, event) in events.iter().enumerate() {
            let observation_id = stored
                .observation_ids
                .get(index)
                .copied()
                .unwrap_or(last_id);
            self.queue.mark_event_completed(event.id, observation_id)?;
        }

        tracing::info!(
            session_db_id,
            events = events.len(),
            observations = observations.len(),
            tokens = completion.total_tokens,
            "Summarized event group"
        );
        Ok(())
    }

    fn fail_group(&self, events: &[RawToolEvent], message: &str) -> anyhow::Result<()> {
        for event in events {
            self.queue.mark_event_failed(event.id, message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::queue::{EventStatus, NewToolEvent, MAX_RETRIES};
    use crate::workers::testing::{FakeLlm, FakeStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

    const OBSERVATION_XML: &str = "<observation><type>discovery</type>\
        <title>Found the config loader</title></observation>";

    fn temp_queue() -> Arc<EventQueue> {
        let n = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "claude-mem-events-test-{}-{}.db",
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_file(&path);
        Arc::new(EventQueue::open(&path).expect("open test queue"))
    }

    fn summarizer(
        queue: Arc<EventQueue>,
        store: Arc<FakeStore>,
        llm: Arc<FakeLlm>,
    ) -> EventSummarizer {
        EventSummarizer {
            settings: EventWorkerSettings::default(),
            queue,
            store,
            llm,
            mode: Mode::default(),
            ticks: 0,
        }
    }

    fn insert_event(queue: &EventQueue, session_db_id: i64) -> i64 {
        queue
            .insert_event(NewToolEvent {
                session_db_id,
                content_session_id: format!("content-{}", session_db_id),
                tool_name: "Read".to_string(),
                tool_input: Some(r#"{"path":"/x"}"#.to_string()),
                tool_response: Some(r#"{"ok":true}"#.to_string()),
                cwd: None,
                prompt_number: Some(1),
                project: Some("demo".to_string()),
            })
            .unwrap()
    }

    #[test]
    fn test_happy_path_materializes_observation() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        llm.push_content(OBSERVATION_XML);

        let id = insert_event(&queue, 1);
        let mut worker = summarizer(queue.clone(), store.clone(), llm);
        worker.run_tick().unwrap();

        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Completed);
        assert_ne!(row.observation_id, Some(0));
        assert_eq!(store.observations.lock().unwrap().len(), 1);

        let stats = queue.event_stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_retry_budget_across_ticks() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        for _ in 0..3 {
            llm.push_error(LlmError::Upstream {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }

        let id = insert_event(&queue, 1);
        let mut worker = summarizer(queue.clone(), store, llm.clone());

        worker.run_tick().unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!((row.status, row.retry_count), (EventStatus::Pending, 1));

        worker.run_tick().unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!((row.status, row.retry_count), (EventStatus::Pending, 2));

        worker.run_tick().unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!((row.status, row.retry_count), (EventStatus::Failed, MAX_RETRIES));
        assert!(row.error_message.unwrap().contains("502"));

        // Tick 4 is a no-op: nothing pending, no further LLM calls
        let calls_before = llm.call_count();
        worker.run_tick().unwrap();
        assert_eq!(llm.call_count(), calls_before);
    }

    #[test]
    fn test_empty_parse_completes_with_zero_id() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        llm.push_content("I found nothing worth keeping.");

        let id = insert_event(&queue, 1);
        let mut worker = summarizer(queue.clone(), store.clone(), llm);
        worker.run_tick().unwrap();

        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Completed);
        assert_eq!(row.observation_id, Some(0));
        assert!(store.observations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_session_fails_group() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        // No session registered for id 9

        let id = insert_event(&queue, 9);
        let mut worker = summarizer(queue.clone(), store, llm.clone());
        worker.run_tick().unwrap();

        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.error_message.unwrap().contains("not found"));
        // The LLM was never consulted
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn test_missing_memory_session_id_fails_group() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, None, Some("demo"));

        let id = insert_event(&queue, 1);
        let mut worker = summarizer(queue.clone(), store, llm);
        worker.run_tick().unwrap();

        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert!(row
            .error_message
            .unwrap()
            .contains("no memory session id"));
    }

    #[test]
    fn test_surplus_events_reuse_last_observation_id() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        // Three events compress into one observation
        llm.push_content(OBSERVATION_XML);

        let ids: Vec<i64> = (0..3).map(|_| insert_event(&queue, 1)).collect();
        let mut worker = summarizer(queue.clone(), store, llm);
        worker.run_tick().unwrap();

        let first = queue.get_event(ids[0]).unwrap().unwrap().observation_id;
        for id in &ids {
            let row = queue.get_event(*id).unwrap().unwrap();
            assert_eq!(row.status, EventStatus::Completed);
            assert_eq!(row.observation_id, first);
        }
    }

    #[test]
    fn test_groups_are_per_session() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        store.add_session(2, Some("mem-2"), Some("demo"));
        llm.push_content(OBSERVATION_XML);
        llm.push_content(OBSERVATION_XML);

        insert_event(&queue, 1);
        insert_event(&queue, 2);
        insert_event(&queue, 1);

        let mut worker = summarizer(queue, store, llm.clone());
        worker.run_tick().unwrap();

        // Two sessions, two LLM calls; session 1's call carries both events
        assert_eq!(llm.call_count(), 2);
        let calls = llm.calls.lock().unwrap();
        assert_eq!(calls[0].matches("<event tool=").count(), 2);
        assert_eq!(calls[1].matches("<event tool=").count(), 1);
    }

    #[test]
    fn test_storage_failure_aborts_tick_leaving_claims() {
        let queue = temp_queue();
        let store = Arc::new(FakeStore::new());
        let llm = Arc::new(FakeLlm::new());
        store.add_session(1, Some("mem-1"), Some("demo"));
        llm.push_content(OBSERVATION_XML);
        *store.fail_store.lock().unwrap() = true;

        let id = insert_event(&queue, 1);
        let mut worker = summarizer(queue.clone(), store, llm);
        assert!(worker.run_tick().is_err());

        // Row neither failed nor completed: stall release will recover it
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Summarizing);
        assert_eq!(row.retry_count, 0);
    }

    #[test]
    fn test_worker_thread_lifecycle() {
        let queue = temp_queue();
        let store: Arc<FakeStore> = Arc::new(FakeStore::new());
        let llm: Arc<FakeLlm> = Arc::new(FakeLlm::new());

        let worker = EventWorker::start(
            EventWorkerSettings {
                tick_interval: Duration::from_millis(50),
                ..Default::default()
            },
            queue,
            store,
            llm,
            Mode::default(),
        )
        .unwrap();

        worker.trigger_tick();
        worker.shutdown().unwrap();
    }
}
