//! Session memory store - the materialization target for the pipeline
//!
//! Raw queue rows are enriched into observations and session summaries and
//! persisted here. The workers only ever touch the three operations on the
//! [`SessionStore`] trait; the HTTP init endpoint additionally registers
//! content sessions on the concrete SQLite store.

mod sqlite;

pub use sqlite::SqliteMemoryStore;

use serde::{Deserialize, Serialize};

/// A registered assistant session
///
/// `content_session_id` is the transient token the hooks know; the
/// `memory_session_id` is the stable identifier observations are filed
/// under. A session without a memory id cannot be materialized against.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: Option<String>,
}

/// A structured record derived from one or more raw tool events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observation kind, e.g. "discovery", "change", "decision"
    pub kind: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub narrative: Option<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// A structured end-of-turn record for one user turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

/// Recent observation context handed to the summary prompt
#[derive(Debug, Clone)]
pub struct RecentObservation {
    pub kind: String,
    pub text: String,
}

/// Ids assigned by a materialization batch
#[derive(Debug, Clone, Default)]
pub struct StoredBatch {
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
}

/// Operations the summarization workers need from the memory layer.
///
/// Kept minimal so tests can substitute an in-memory fake.
pub trait SessionStore: Send + Sync {
    /// Look up a session by its database id.
    fn get_session_by_id(&self, session_db_id: i64) -> anyhow::Result<Option<SessionRecord>>;

    /// Persist a batch of observations (and optionally a summary) in one
    /// transaction, returning the assigned ids in input order.
    fn store_observations(
        &self,
        memory_session_id: &str,
        project: Option<&str>,
        observations: &[Observation],
        summary: Option<&SessionSummary>,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> anyhow::Result<StoredBatch>;

    /// Most recent observations for a project, newest first. Advisory
    /// context only; callers tolerate failure.
    fn get_recent_observations(
        &self,
        project: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<RecentObservation>>;
}
