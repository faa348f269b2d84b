//! Summary summarizer worker
//!
//! Same loop shape as the event worker, but each claimed request already
//! pertains to exactly one session, so there is no grouping step - requests
//! are processed one at a time. The request's denormalized
//! `memory_session_id` may be stale; the authoritative value is always
//! re-fetched from the session record at materialization time.

use super::{prompt, CompletionSignal, Mode, WorkerCommand};
use crate::llm::{CompletionClient, CompletionRequest, MAX_TOKENS_SUMMARY};
use crate::memory::SessionStore;
use crate::parser;
use crate::queue::{EventQueue, RawSummaryRequest};
use crate::util::now_epoch_ms;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How many recent observations to offer the model as context
const RECENT_CONTEXT_LIMIT: usize = 10;

/// Tuning knobs for the summary worker
#[derive(Debug, Clone)]
pub struct SummaryWorkerSettings {
    pub tick_interval: Duration,
    pub batch_size: usize,
    pub gc_every_ticks: u64,
    pub release_every_ticks: u64,
    pub stall_threshold: Duration,
    pub retention: Duration,
}

impl Default for SummaryWorkerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10_000),
            batch_size: 5,
            gc_every_ticks: 100,
            release_every_ticks: 30,
            stall_threshold: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Handle to the running summary worker thread
pub struct SummaryWorker {
    tx: SyncSender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<CompletionSignal>,
}

impl SummaryWorker {
    pub fn start(
        settings: SummaryWorkerSettings,
        queue: Arc<EventQueue>,
        store: Arc<dyn SessionStore>,
        llm: Arc<dyn CompletionClient>,
        mode: Mode,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<WorkerCommand>(10);

        let completion = Arc::new(CompletionSignal::new());
        let thread_completion = completion.clone();

        let handle = thread::Builder::new()
            .name("summary-summarizer".into())
            .spawn(move || {
                let mut summarizer = SummarySummarizer {
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

    #[allow(dead_code)] // Reserved for intake-burst nudging
    pub fn trigger_tick(&self) {
        let _ = self.tx.try_send(WorkerCommand::Tick);
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        let _ = self.tx.send(WorkerCommand::Shutdown);

        let timeout = crate::llm::REQUEST_TIMEOUT + Duration::from_secs(5);
        if !self.completion.wait(timeout) {
            tracing::warn!("Summary worker did not complete within {:?}", timeout);
            anyhow::bail!("Shutdown timeout");
        }
        tracing::debug!("Summary worker shutdown complete");
        Ok(())
    }
}

impl Drop for SummaryWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) struct SummarySummarizer {
    pub(crate) settings: SummaryWorkerSettings,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) llm: Arc<dyn CompletionClient>,
    pub(crate) mode: Mode,
    pub(crate) ticks: u64,
}

impl SummarySummarizer {
    fn run(&mut self, rx: mpsc::Receiver<WorkerCommand>) {
        match self.queue.release_stuck_summaries(0) {
            Ok(0) => {}
            Ok(released) => {
                tracing::info!(released, "Released stale summary claims from previous run")
            }
            Err(e) => tracing::error!("Failed to release stale summary claims: {}", e),
        }

        tracing::info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            mode = %self.mode.name,
            "Summary worker started"
        );

        loop {
            match rx.recv_timeout(self.settings.tick_interval) {
                Ok(WorkerCommand::Tick) | Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.run_tick() {
                        tracing::error!("Summary tick aborted: {}", e);
                    }
                }
                Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Summary worker received shutdown");
                    break;
                }
            }
        }
    }

    pub(crate) fn run_tick(&mut self) -> anyhow::Result<()> {
        self.ticks += 1;

        if self.ticks % self.settings.gc_every_ticks == 0 {
            let cutoff = now_epoch_ms() - self.settings.retention.as_millis() as i64;
            match self.queue.delete_completed_summaries(cutoff) {
                Ok(0) => {}
                Ok(deleted) => tracing::debug!(deleted, "Deleted expired completed summaries"),
                Err(e) => tracing::warn!("Completed-summary cleanup failed: {}", e),
            }
        }

        if self.ticks % self.settings.release_every_ticks == 0 {
            match self
                .queue
                .release_stuck_summaries(self.settings.stall_threshold.as_millis() as i64)
            {
                Ok(0) => {}
                Ok(released) => tracing::warn!(released, "Released stalled summary claims"),
                Err(e) => tracing::warn!("Stall release failed: {}", e),
            }
        }

        let claimed = self.queue.claim_summary_requests(self.settings.batch_size)?;
        for request in claimed {
            self.process_request(request)?;
        }

        Ok(())
    }

    /// Materialize one summary request. `Err` only for storage failures.
    fn process_request(&self, request: RawSummaryRequest) -> anyhow::Result<()> {
        let session = self.store.get_session_by_id(request.session_db_id)?;

        let Some(session) = session else {
            let message = format!("Session {} not found", request.session_db_id);
            self.queue.mark_summary_failed(request.id, &message)?;
            return Ok(());
        };
        // The denormalized copy on the request may be stale; only the
        // session record's value counts.
        let Some(memory_session_id) = session.memory_session_id.clone() else {
            let message = format!("Session {} has no memory session id", request.session_db_id);
            self.queue.mark_summary_failed(request.id, &message)?;
            return Ok(());
        };

        let project = session.project.as_deref().or(request.project.as_deref());

        // Recent activity is advisory context; a fetch failure is not worth
        // failing the request over
        let recent = match project {
            Some(project) => self
                .store
                .get_recent_observations(project, RECENT_CONTEXT_LIMIT)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let completion_request = CompletionRequest::new(
            prompt::build_summary_prompt(&self.mode, &request, &recent),
            MAX_TOKENS_SUMMARY,
        );
        let completion = match self.llm.complete(&completion_request) {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(request_id = request.id, "LLM call failed: {}", e);
                self.queue.mark_summary_failed(request.id, &e.to_string())?;
                return Ok(());
            }
        };

        let Some(summary) = parser::parse_summary(&completion.content, request.session_db_id)
        else {
            self.queue
                .mark_summary_failed(request.id, "Failed to parse summary from LLM response")?;
            return Ok(());
        };

        let stored = self.store.store_observations(
            &memory_session_id,
            project,
            &[],
            Some(&summary),
            None,
            completion.total_tokens,
        )?;

        self.queue
            .mark_summary_completed(request.id, stored.summary_id.unwrap_or(0))?;

        tracing::info!(
            request_id = request.id,
            session_db_id = request.session_db_id,
            tokens = completion.total_tokens,
            "Materialized session summary"
        );
        Ok(())
    }
}
