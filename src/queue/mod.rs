//! Durable intake queue for raw tool events and summary requests
//!
//! The "Raw First, Summarize Later" pipeline rests on this module: hooks
//! append raw rows synchronously, background workers claim and enrich them
//! later. The lease is encoded as a status column rather than a separate
//! lease table, and crash recovery is a stall-release sweep rather than
//! per-worker heartbeats.
//!
//! # Row lifecycle
//!
//! ```text
//! pending ──claim──▶ summarizing ──▶ completed (terminal, GC'd after 1h)
//!    ▲                    │
//!    └──markFailed────────┤  retry_count += 1, until MAX_RETRIES
//!                         └──▶ failed (terminal, error preserved)
//! ```
//!
//! A row stuck in `summarizing` past the stall threshold is presumed to
//! belong to a dead worker and is released back to `pending` without
//! touching `retry_count`.

mod store;

pub use store::EventQueue;

use serde::Serialize;
use std::fmt;

/// Retry budget: a row that fails this many times lands in `failed` for good.
pub const MAX_RETRIES: i64 = 3;

/// Byte cap applied to `tool_response` at insert time. Keeps any single row
/// comfortably inside the page cache no matter what a tool returned.
pub const TOOL_RESPONSE_CAP: usize = 50_000;

/// Suffix appended to a capped `tool_response`.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Processing status of a queued row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Summarizing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Summarizing => "summarizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "summarizing" => Self::Summarizing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw tool event as captured from a hook, ready for insertion
#[derive(Debug, Clone)]
pub struct NewToolEvent {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub tool_name: String,
    /// Opaque structured payload, serialized JSON
    pub tool_input: Option<String>,
    /// Opaque structured payload, serialized JSON (capped at insert)
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub prompt_number: Option<i64>,
    pub project: Option<String>,
}

/// A raw tool event row as read back from the queue
#[derive(Debug, Clone)]
pub struct RawToolEvent {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub tool_name: String,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub cwd: Option<String>,
    pub prompt_number: Option<i64>,
    pub project: Option<String>,
    pub status: EventStatus,
    pub retry_count: i64,
    pub created_at_epoch: i64,
    pub summarized_at_epoch: Option<i64>,
    pub observation_id: Option<i64>,
    pub error_message: Option<String>,
}

/// An end-of-turn summary request, ready for insertion
#[derive(Debug, Clone)]
pub struct NewSummaryRequest {
    pub session_db_id: i64,
    pub content_session_id: String,
    /// Denormalized copy; the worker re-fetches the authoritative value
    /// from the session record at materialization time.
    pub memory_session_id: Option<String>,
    pub project: Option<String>,
    pub user_prompt: Option<String>,
    pub last_assistant_message: Option<String>,
}

/// A summary request row as read back from the queue
#[derive(Debug, Clone)]
pub struct RawSummaryRequest {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: Option<String>,
    pub user_prompt: Option<String>,
    pub last_assistant_message: Option<String>,
    pub status: EventStatus,
    pub retry_count: i64,
    pub created_at_epoch: i64,
    pub summarized_at_epoch: Option<i64>,
    pub summary_id: Option<i64>,
    pub error_message: Option<String>,
}

/// Per-status row counts for one queue table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub summarizing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Errors surfaced by queue operations
///
/// `DuplicatePending` is the only business rejection; everything else means
/// the embedded store itself refused us and maps to a 5xx at the intake
/// boundary.
#[derive(Debug)]
pub enum QueueError {
    /// A pending/summarizing summary request already exists for the session
    DuplicatePending { session_db_id: i64 },
    /// SQLite rejected the operation
    Storage(rusqlite::Error),
    /// Could not check a connection out of the pool
    Pool(r2d2::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicatePending { session_db_id } => write!(
                f,
                "A summary request is already pending for session {}",
                session_db_id
            ),
            Self::Storage(e) => write!(f, "Storage error: {}", e),
            Self::Pool(e) => write!(f, "Connection pool error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e)
    }
}

impl From<r2d2::Error> for QueueError {
    fn from(e: r2d2::Error) -> Self {
        Self::Pool(e)
    }
}
