//! SQLite-backed queue storage
//!
//! Uses a connection pool over a single database file in WAL mode. Writes
//! from the intake path and the two worker threads are serialized by
//! SQLite's transaction engine; claims use `BEGIN IMMEDIATE` so two workers
//! can never select the same pending rows.

use super::{
    EventStatus, NewSummaryRequest, NewToolEvent, QueueError, QueueStats, RawSummaryRequest,
    RawToolEvent, MAX_RETRIES, TOOL_RESPONSE_CAP, TRUNCATION_MARKER,
};
use crate::util::{now_epoch_ms, truncate_utf8_safe};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;

/// Durable event queue over the embedded store
///
/// One instance is shared between the intake handlers and both workers.
/// Every method is a self-contained transaction; the queue holds no state
/// outside SQLite.
pub struct EventQueue {
    pool: Pool<SqliteConnectionManager>,
}

impl EventQueue {
    /// Open (or create) the queue database and run migrations.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, QueueError> {
        if let Some(parent) = db_path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                "#,
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, QueueError> {
        Ok(self.pool.get()?)
    }

    /// Initialize schema and run migrations
    fn init_schema(conn: &Connection) -> Result<(), QueueError> {
        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(
                    (SELECT CAST(value AS INTEGER) FROM queue_metadata WHERE key = 'schema_version'),
                    0
                )",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::apply_schema_v1(conn)?;
        }

        Ok(())
    }

    /// Initial schema (v1)
    fn apply_schema_v1(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            r#"
            -- Metadata table (created first for version tracking)
            CREATE TABLE IF NOT EXISTS queue_metadata (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            -- Raw tool events captured from the PostToolUse hook
            CREATE TABLE IF NOT EXISTS raw_tool_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_db_id INTEGER NOT NULL,
                content_session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                tool_input TEXT,
                tool_response TEXT,
                cwd TEXT,
                prompt_number INTEGER,
                project TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at_epoch INTEGER NOT NULL,
                summarized_at_epoch INTEGER,
                observation_id INTEGER,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_raw_events_status
                ON raw_tool_events(status, created_at_epoch);
            CREATE INDEX IF NOT EXISTS idx_raw_events_session
                ON raw_tool_events(session_db_id);

            -- End-of-turn summary requests captured from the Stop hook
            CREATE TABLE IF NOT EXISTS raw_summary_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_db_id INTEGER NOT NULL,
                content_session_id TEXT NOT NULL,
                memory_session_id TEXT,
                project TEXT,
                user_prompt TEXT,
                last_assistant_message TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at_epoch INTEGER NOT NULL,
                summarized_at_epoch INTEGER,
                summary_id INTEGER,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_raw_summaries_status
                ON raw_summary_requests(status, created_at_epoch);
            CREATE INDEX IF NOT EXISTS idx_raw_summaries_session
                ON raw_summary_requests(session_db_id);

            -- Set initial version
            INSERT INTO queue_metadata (key, value) VALUES ('schema_version', '1');
            "#,
        )?;

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────

    /// Append a raw tool event. Single transactional write, no network I/O;
    /// this is the hook's hot path and must return in milliseconds.
    pub fn insert_event(&self, event: NewToolEvent) -> Result<i64, QueueError> {
        let conn = self.conn()?;

        let tool_response = event.tool_response.map(|r| Self::cap_response(r));

        conn.execute(
            "INSERT INTO raw_tool_events
                 (session_db_id, content_session_id, tool_name, tool_input, tool_response,
                  cwd, prompt_number, project, status, retry_count, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, ?9)",
            params![
                event.session_db_id,
                event.content_session_id,
                event.tool_name,
                event.tool_input,
                tool_response,
                event.cwd,
                event.prompt_number,
                event.project,
                now_epoch_ms(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Append a summary request. Rejects the insert if the session already
    /// has a request in flight (pending or summarizing); the guard and the
    /// insert share one immediate transaction so two racing inserts cannot
    /// both land.
    pub fn insert_summary_request(&self, request: NewSummaryRequest) -> Result<i64, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM raw_summary_requests
             WHERE session_db_id = ?1 AND status IN ('pending', 'summarizing')",
            params![request.session_db_id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Err(QueueError::DuplicatePending {
                session_db_id: request.session_db_id,
            });
        }

        tx.execute(
            "INSERT INTO raw_summary_requests
                 (session_db_id, content_session_id, memory_session_id, project,
                  user_prompt, last_assistant_message, status, retry_count, created_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)",
            params![
                request.session_db_id,
                request.content_session_id,
                request.memory_session_id,
                request.project,
                request.user_prompt,
                request.last_assistant_message,
                now_epoch_ms(),
            ],
        )?;

        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Cap an oversized tool response and tag it so readers know data was cut.
    fn cap_response(response: String) -> String {
        if response.len() <= TOOL_RESPONSE_CAP {
            return response;
        }
        let mut capped = truncate_utf8_safe(&response, TOOL_RESPONSE_CAP).to_string();
        capped.push_str(TRUNCATION_MARKER);
        capped
    }

    // ─────────────────────────────────────────────────────────────────────
    // Claiming
    // ─────────────────────────────────────────────────────────────────────

    /// Atomically claim up to `limit` pending events, oldest first.
    ///
    /// The select and the status flip run inside one immediate transaction,
    /// so two concurrent claims always return disjoint id sets.
    pub fn claim_events(&self, limit: usize) -> Result<Vec<RawToolEvent>, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM raw_tool_events
                 WHERE status = 'pending'
                 ORDER BY created_at_epoch ASC, id ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        for id in &ids {
            tx.execute(
                "UPDATE raw_tool_events SET status = 'summarizing' WHERE id = ?1",
                params![id],
            )?;
        }

        let mut events = Vec::with_capacity(ids.len());
        for id in &ids {
            events.push(tx.query_row(
                "SELECT id, session_db_id, content_session_id, tool_name, tool_input,
                        tool_response, cwd, prompt_number, project, status, retry_count,
                        created_at_epoch, summarized_at_epoch, observation_id, error_message
                 FROM raw_tool_events WHERE id = ?1",
                params![id],
                Self::map_event_row,
            )?);
        }

        tx.commit()?;
        Ok(events)
    }

    /// Atomically claim up to `limit` pending summary requests, oldest first.
    pub fn claim_summary_requests(
        &self,
        limit: usize,
    ) -> Result<Vec<RawSummaryRequest>, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM raw_summary_requests
                 WHERE status = 'pending'
                 ORDER BY created_at_epoch ASC, id ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        for id in &ids {
            tx.execute(
                "UPDATE raw_summary_requests SET status = 'summarizing' WHERE id = ?1",
                params![id],
            )?;
        }

        let mut requests = Vec::with_capacity(ids.len());
        for id in &ids {
            requests.push(tx.query_row(
                "SELECT id, session_db_id, content_session_id, memory_session_id, project,
                        user_prompt, last_assistant_message, status, retry_count,
                        created_at_epoch, summarized_at_epoch, summary_id, error_message
                 FROM raw_summary_requests WHERE id = ?1",
                params![id],
                Self::map_summary_row,
            )?);
        }

        tx.commit()?;
        Ok(requests)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completion and failure
    // ─────────────────────────────────────────────────────────────────────

    /// Mark an event done. `observation_id` 0 means the model intentionally
    /// produced no observation for it.
    pub fn mark_event_completed(&self, id: i64, observation_id: i64) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE raw_tool_events
             SET status = 'completed', summarized_at_epoch = ?1, observation_id = ?2
             WHERE id = ?3",
            params![now_epoch_ms(), observation_id, id],
        )?;
        Ok(())
    }

    /// Mark a summary request done.
    pub fn mark_summary_completed(&self, id: i64, summary_id: i64) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE raw_summary_requests
             SET status = 'completed', summarized_at_epoch = ?1, summary_id = ?2
             WHERE id = ?3",
            params![now_epoch_ms(), summary_id, id],
        )?;
        Ok(())
    }

    /// Record a failure against an event. Below the retry budget the row
    /// reverts to `pending` and will be claimed again; at the budget it
    /// terminates in `failed` with the last error preserved.
    pub fn mark_event_failed(&self, id: i64, error_message: &str) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        Self::mark_failed(&mut conn, "raw_tool_events", id, error_message)
    }

    /// Record a failure against a summary request (same budget rules).
    pub fn mark_summary_failed(&self, id: i64, error_message: &str) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        Self::mark_failed(&mut conn, "raw_summary_requests", id, error_message)
    }

    fn mark_failed(
        conn: &mut Connection,
        table: &str,
        id: i64,
        error_message: &str,
    ) -> Result<(), QueueError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let retry_count: i64 = tx.query_row(
            &format!("SELECT retry_count FROM {} WHERE id = ?1", table),
            params![id],
            |row| row.get(0),
        )?;

        let new_count = retry_count + 1;
        let new_status = if new_count >= MAX_RETRIES {
            "failed"
        } else {
            "pending"
        };

        tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, retry_count = ?2, error_message = ?3 WHERE id = ?4",
                table
            ),
            params![new_status, new_count, error_message, id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery and cleanup
    // ─────────────────────────────────────────────────────────────────────

    /// Release events stuck in `summarizing` longer than `older_than_ms`
    /// back to `pending`. Crash recovery: a stalled claim means its worker
    /// died mid-tick. `retry_count` is untouched; the row never got a fair
    /// attempt. Called with 0 at startup (release everything) and
    /// periodically with the stall threshold.
    pub fn release_stuck_events(&self, older_than_ms: i64) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        Self::release_stuck(&conn, "raw_tool_events", older_than_ms)
    }

    /// Release stalled summary requests (same rules as events).
    pub fn release_stuck_summaries(&self, older_than_ms: i64) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        Self::release_stuck(&conn, "raw_summary_requests", older_than_ms)
    }

    fn release_stuck(
        conn: &Connection,
        table: &str,
        older_than_ms: i64,
    ) -> Result<usize, QueueError> {
        let cutoff = now_epoch_ms() - older_than_ms;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET status = 'pending'
                 WHERE status = 'summarizing' AND created_at_epoch < ?1",
                table
            ),
            params![cutoff],
        )?;
        Ok(changed)
    }

    /// Delete completed events summarized before `older_than_epoch`.
    pub fn delete_completed_events(&self, older_than_epoch: i64) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM raw_tool_events
             WHERE status = 'completed' AND summarized_at_epoch < ?1",
            params![older_than_epoch],
        )?;
        Ok(deleted)
    }

    /// Delete completed summary requests summarized before `older_than_epoch`.
    pub fn delete_completed_summaries(&self, older_than_epoch: i64) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM raw_summary_requests
             WHERE status = 'completed' AND summarized_at_epoch < ?1",
            params![older_than_epoch],
        )?;
        Ok(deleted)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Monitoring
    // ─────────────────────────────────────────────────────────────────────

    /// Per-status counts for the tool-event table.
    pub fn event_stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn()?;
        Self::stats(&conn, "raw_tool_events")
    }

    /// Per-status counts for the summary-request table.
    pub fn summary_stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn()?;
        Self::stats(&conn, "raw_summary_requests")
    }

    fn stats(conn: &Connection, table: &str) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "summarizing" => stats.summarizing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Fetch a single event row.
    #[allow(dead_code)] // Test and diagnostic access
    pub fn get_event(&self, id: i64) -> Result<Option<RawToolEvent>, QueueError> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                "SELECT id, session_db_id, content_session_id, tool_name, tool_input,
                        tool_response, cwd, prompt_number, project, status, retry_count,
                        created_at_epoch, summarized_at_epoch, observation_id, error_message
                 FROM raw_tool_events WHERE id = ?1",
                params![id],
                Self::map_event_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(event)
    }

    /// Fetch a single summary request row.
    #[allow(dead_code)] // Test and diagnostic access
    pub fn get_summary_request(&self, id: i64) -> Result<Option<RawSummaryRequest>, QueueError> {
        let conn = self.conn()?;
        let request = conn
            .query_row(
                "SELECT id, session_db_id, content_session_id, memory_session_id, project,
                        user_prompt, last_assistant_message, status, retry_count,
                        created_at_epoch, summarized_at_epoch, summary_id, error_message
                 FROM raw_summary_requests WHERE id = ?1",
                params![id],
                Self::map_summary_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(request)
    }

    /// Backdate a row's `created_at_epoch` (test support for stall logic).
    #[cfg(test)]
    pub fn set_event_created_at(&self, id: i64, epoch_ms: i64) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE raw_tool_events SET created_at_epoch = ?1 WHERE id = ?2",
            params![epoch_ms, id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn set_event_status(&self, id: i64, status: EventStatus) -> Result<(), QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE raw_tool_events SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawToolEvent> {
        Ok(RawToolEvent {
            id: row.get(0)?,
            session_db_id: row.get(1)?,
            content_session_id: row.get(2)?,
            tool_name: row.get(3)?,
            tool_input: row.get(4)?,
            tool_response: row.get(5)?,
            cwd: row.get(6)?,
            prompt_number: row.get(7)?,
            project: row.get(8)?,
            status: EventStatus::from_str(&row.get::<_, String>(9)?),
            retry_count: row.get(10)?,
            created_at_epoch: row.get(11)?,
            summarized_at_epoch: row.get(12)?,
            observation_id: row.get(13)?,
            error_message: row.get(14)?,
        })
    }

    fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSummaryRequest> {
        Ok(RawSummaryRequest {
            id: row.get(0)?,
            session_db_id: row.get(1)?,
            content_session_id: row.get(2)?,
            memory_session_id: row.get(3)?,
            project: row.get(4)?,
            user_prompt: row.get(5)?,
            last_assistant_message: row.get(6)?,
            status: EventStatus::from_str(&row.get::<_, String>(7)?),
            retry_count: row.get(8)?,
            created_at_epoch: row.get(9)?,
            summarized_at_epoch: row.get(10)?,
            summary_id: row.get(11)?,
            error_message: row.get(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Unique temp-file database per test (in-memory SQLite would give each
    /// pooled connection its own private database).
    fn temp_queue() -> (EventQueue, std::path::PathBuf) {
        let n = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "claude-mem-queue-test-{}-{}.db",
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_file(&path);
        let queue = EventQueue::open(&path).expect("open test queue");
        (queue, path)
    }

    fn sample_event(session_db_id: i64) -> NewToolEvent {
        NewToolEvent {
            session_db_id,
            content_session_id: "content-abc".to_string(),
            tool_name: "Read".to_string(),
            tool_input: Some(r#"{"path":"/x"}"#.to_string()),
            tool_response: Some(r#"{"ok":true}"#.to_string()),
            cwd: Some("/work".to_string()),
            prompt_number: Some(1),
            project: Some("demo".to_string()),
        }
    }

    #[test]
    fn test_insert_creates_pending_row() {
        let (queue, _path) = temp_queue();

        let id = queue.insert_event(sample_event(1)).unwrap();
        let row = queue.get_event(id).unwrap().unwrap();

        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.tool_name, "Read");
        assert!(row.created_at_epoch > 0);
        assert_eq!(queue.event_stats().unwrap().pending, 1);
    }

    #[test]
    fn test_oversize_response_truncated_with_marker() {
        let (queue, _path) = temp_queue();

        let mut event = sample_event(1);
        event.tool_response = Some("x".repeat(100_000));
        let id = queue.insert_event(event).unwrap();

        let stored = queue.get_event(id).unwrap().unwrap().tool_response.unwrap();
        assert_eq!(stored.len(), TOOL_RESPONSE_CAP + TRUNCATION_MARKER.len());
        assert!(stored.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_claim_flips_to_summarizing_oldest_first() {
        let (queue, _path) = temp_queue();

        let first = queue.insert_event(sample_event(1)).unwrap();
        let second = queue.insert_event(sample_event(2)).unwrap();
        queue.set_event_created_at(second, 1).unwrap(); // make it the oldest

        let claimed = queue.claim_events(1).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second);
        assert_eq!(claimed[0].status, EventStatus::Summarizing);

        // First row untouched
        let row = queue.get_event(first).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
    }

    #[test]
    fn test_claim_empty_queue_returns_nothing() {
        let (queue, _path) = temp_queue();
        assert!(queue.claim_events(10).unwrap().is_empty());
        assert!(queue.claim_summary_requests(10).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_claims_are_disjoint() {
        let (queue, _path) = temp_queue();
        for i in 0..100 {
            queue.insert_event(sample_event(i)).unwrap();
        }

        let queue = Arc::new(queue);
        let q1 = queue.clone();
        let q2 = queue.clone();
        let h1 = std::thread::spawn(move || q1.claim_events(10).unwrap());
        let h2 = std::thread::spawn(move || q2.claim_events(10).unwrap());
        let a = h1.join().unwrap();
        let b = h2.join().unwrap();

        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 10);
        let ids_a: std::collections::HashSet<i64> = a.iter().map(|e| e.id).collect();
        let ids_b: std::collections::HashSet<i64> = b.iter().map(|e| e.id).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 20);
    }

    #[test]
    fn test_mark_completed_sets_observation_link() {
        let (queue, _path) = temp_queue();
        let id = queue.insert_event(sample_event(1)).unwrap();
        queue.claim_events(1).unwrap();

        queue.mark_event_completed(id, 77).unwrap();

        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Completed);
        assert_eq!(row.observation_id, Some(77));
        assert!(row.summarized_at_epoch.is_some());
    }

    #[test]
    fn test_retry_budget_terminates_in_failed() {
        let (queue, _path) = temp_queue();
        let id = queue.insert_event(sample_event(1)).unwrap();

        // Tick 1: claim + fail -> back to pending, retry 1
        queue.claim_events(1).unwrap();
        queue.mark_event_failed(id, "upstream 502").unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.retry_count, 1);

        // Tick 2
        queue.claim_events(1).unwrap();
        queue.mark_event_failed(id, "upstream 502").unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.retry_count, 2);

        // Tick 3: budget exhausted -> terminal
        queue.claim_events(1).unwrap();
        queue.mark_event_failed(id, "upstream 503").unwrap();
        let row = queue.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Failed);
        assert_eq!(row.retry_count, MAX_RETRIES);
        assert_eq!(row.error_message.as_deref(), Some("upstream 503"));

        // Tick 4: nothing left to claim
        assert!(queue.claim_events(1).unwrap().is_empty());
    }

    #[test]
    fn test_release_stuck_respects_threshold_and_retry_count() {
        let (queue, _path) = temp_queue();

        let stale = queue.insert_event(sample_event(1)).unwrap();
        let fresh = queue.insert_event(sample_event(2)).unwrap();
        queue.set_event_status(stale, EventStatus::Summarizing).unwrap();
        queue.set_event_status(fresh, EventStatus::Summarizing).unwrap();
        // Stale row started ten minutes ago
        queue
            .set_event_created_at(stale, now_epoch_ms() - 10 * 60 * 1000)
            .unwrap();

        let released = queue.release_stuck_events(5 * 60 * 1000).unwrap();
        assert_eq!(released, 1);

        let row = queue.get_event(stale).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.retry_count, 0);

        let row = queue.get_event(fresh).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Summarizing);
    }

    #[test]
    fn test_release_all_at_startup() {
        let (queue, _path) = temp_queue();
        let id = queue.insert_event(sample_event(1)).unwrap();
        queue.set_event_status(id, EventStatus::Summarizing).unwrap();

        // Threshold 0 releases everything regardless of age
        assert_eq!(queue.release_stuck_events(0).unwrap(), 1);
        assert_eq!(
            queue.get_event(id).unwrap().unwrap().status,
            EventStatus::Pending
        );
    }

    #[test]
    fn test_delete_completed_only_removes_old_terminal_rows() {
        let (queue, _path) = temp_queue();

        let done = queue.insert_event(sample_event(1)).unwrap();
        let live = queue.insert_event(sample_event(2)).unwrap();
        queue.claim_events(2).unwrap();
        queue.mark_event_completed(done, 1).unwrap();

        // Cutoff in the future: the completed row qualifies, the live one never does
        let removed = queue
            .delete_completed_events(now_epoch_ms() + 1000)
            .unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get_event(done).unwrap().is_none());
        assert!(queue.get_event(live).unwrap().is_some());

        // Cutoff in the past removes nothing
        let id = queue.insert_event(sample_event(3)).unwrap();
        queue.claim_events(1).unwrap();
        queue.mark_event_completed(id, 2).unwrap();
        assert_eq!(queue.delete_completed_events(0).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_summary_request_rejected() {
        let (queue, _path) = temp_queue();

        let request = NewSummaryRequest {
            session_db_id: 42,
            content_session_id: "content-abc".to_string(),
            memory_session_id: None,
            project: Some("demo".to_string()),
            user_prompt: Some("fix the bug".to_string()),
            last_assistant_message: Some("done".to_string()),
        };

        let id = queue.insert_summary_request(request.clone()).unwrap();

        let err = queue.insert_summary_request(request.clone()).unwrap_err();
        assert!(matches!(
            err,
            QueueError::DuplicatePending { session_db_id: 42 }
        ));

        // Once the first completes, a new request is accepted again
        queue.claim_summary_requests(1).unwrap();
        queue.mark_summary_completed(id, 9).unwrap();
        queue.insert_summary_request(request).unwrap();
    }

    #[test]
    fn test_summary_failure_budget() {
        let (queue, _path) = temp_queue();
        let id = queue
            .insert_summary_request(NewSummaryRequest {
                session_db_id: 7,
                content_session_id: "c".to_string(),
                memory_session_id: Some("mem-1".to_string()),
                project: None,
                user_prompt: None,
                last_assistant_message: None,
            })
            .unwrap();

        for attempt in 1..=MAX_RETRIES {
            queue.claim_summary_requests(1).unwrap();
            queue.mark_summary_failed(id, "timeout").unwrap();
            let row = queue.get_summary_request(id).unwrap().unwrap();
            assert_eq!(row.retry_count, attempt);
        }
        let row = queue.get_summary_request(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Failed);
    }

    #[test]
    fn test_stats_count_by_status() {
        let (queue, _path) = temp_queue();

        let a = queue.insert_event(sample_event(1)).unwrap();
        queue.insert_event(sample_event(2)).unwrap();
        queue.claim_events(1).unwrap();
        queue.mark_event_completed(a, 5).unwrap();

        let stats = queue.event_stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.summarizing, 0);
        assert_eq!(stats.failed, 0);
    }
}
