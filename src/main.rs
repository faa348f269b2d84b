// claude-mem - Local memory capture for Claude Code
//
// Hooks POST raw tool events and end-of-turn summary requests to a loopback
// HTTP endpoint; this daemon captures them durably in SQLite and enriches
// them asynchronously into observations and session summaries via an LLM
// provider ("Raw First, Summarize Later").
//
// Architecture:
// - Intake server (axum): accepts hook payloads, one transactional write each
// - Event queue (SQLite): durable rows with a status-column lease
// - Workers (dedicated threads): claim batches, call the LLM, materialize
// - Process tracker + orphan reaper: keep agent subprocesses from leaking

mod cli;
mod config;
mod llm;
mod memory;
mod parser;
mod procs;
mod queue;
mod server;
mod util;
mod workers;

use anyhow::{Context, Result};
use config::Config;
use memory::SqliteMemoryStore;
use procs::{OrphanReaper, ProcessTracker};
use queue::EventQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workers::{EventWorker, Mode, SummaryWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first; if one was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Initialize tracing
    //
    // Precedence: RUST_LOG env var > config level > default "info".
    // File logging is opt-in; the guard must outlive main or buffered
    // lines are lost on shutdown.
    let default_filter = format!("claude_mem={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let _file_guard = if config.logging.file_enabled {
        let appender = tracing_appender::rolling::daily(&config.logging.file_dir, "claude-mem.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    };

    tracing::info!(version = config::VERSION, "claude-mem starting");
    tracing::info!(db = %config.db_path.display(), "Opening embedded store");

    // Storage: queue and memory tables share one database file
    let event_queue =
        Arc::new(EventQueue::open(&config.db_path).context("Failed to open event queue")?);
    let memory_store =
        Arc::new(SqliteMemoryStore::open(&config.db_path).context("Failed to open memory store")?);

    // One completion client shared by both workers
    let llm: Arc<dyn llm::CompletionClient> = Arc::from(llm::create_client(&config.llm));
    let mode = Mode::with_preamble(config.mode_preamble.clone());

    // Background workers
    let event_worker = EventWorker::start(
        config.event_worker.clone(),
        event_queue.clone(),
        memory_store.clone(),
        llm.clone(),
        mode.clone(),
    )
    .context("Failed to start event worker")?;

    let summary_worker = SummaryWorker::start(
        config.summary_worker.clone(),
        event_queue.clone(),
        memory_store.clone(),
        llm,
        mode,
    )
    .context("Failed to start summary worker")?;

    // Process supervision
    let tracker = Arc::new(ProcessTracker::new());
    let reaper = Arc::new(
        OrphanReaper::start(config.reaper.clone(), tracker.clone())
            .context("Failed to start orphan reaper")?,
    );

    // Intake server
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let state = server::AppState {
        queue: event_queue,
        memory: memory_store,
        tracker: tracker.clone(),
        reaper: reaper.clone(),
    };
    let server_handle = tokio::spawn(server::start_server(config.bind_addr, state, shutdown_rx));

    tracing::info!("claude-mem ready");

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");

    // Stop intake first so nothing new lands while workers drain
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    // Workers finish their current tick; a live LLM call runs out its
    // deadline. Rows left in `summarizing` by a hard kill are released on
    // the next start.
    if let Err(e) = event_worker.shutdown() {
        tracing::warn!("Event worker shutdown: {}", e);
    }
    if let Err(e) = summary_worker.shutdown() {
        tracing::warn!("Summary worker shutdown: {}", e);
    }
    if let Err(e) = reaper.shutdown() {
        tracing::warn!("Orphan reaper shutdown: {}", e);
    }

    // Best-effort cleanup of any agent subprocesses still alive
    tracker.terminate_all(Duration::from_secs(5));

    tracing::info!("Shutdown complete");
    Ok(())
}
