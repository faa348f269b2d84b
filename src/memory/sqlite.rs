//! SQLite implementation of the session memory store
//!
//! Shares the database file with the intake queue; owns the `sessions`,
//! `observations` and `summaries` tables.

use super::{
    Observation, RecentObservation, SessionRecord, SessionStore, SessionSummary, StoredBatch,
};
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

pub struct SqliteMemoryStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteMemoryStore {
    /// Open (or create) the memory tables in the given database file.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
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
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("Failed to build memory store pool")?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Registered assistant sessions
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_session_id TEXT NOT NULL UNIQUE,
                memory_session_id TEXT,
                project TEXT,
                started_at_epoch INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_memory ON sessions(memory_session_id);

            -- Observations derived from raw tool events
            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_session_id TEXT NOT NULL,
                project TEXT,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                subtitle TEXT,
                facts TEXT,            -- JSON array
                narrative TEXT,
                concepts TEXT,         -- JSON array
                files_read TEXT,       -- JSON array
                files_modified TEXT,   -- JSON array
                prompt_number INTEGER,
                discovery_tokens INTEGER NOT NULL DEFAULT 0,
                created_at_epoch INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_observations_project
                ON observations(project, created_at_epoch);
            CREATE INDEX IF NOT EXISTS idx_observations_session
                ON observations(memory_session_id);

            -- End-of-turn session summaries
            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_session_id TEXT NOT NULL,
                project TEXT,
                request TEXT,
                investigated TEXT,
                learned TEXT,
                completed TEXT,
                next_steps TEXT,
                notes TEXT,
                created_at_epoch INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_session
                ON summaries(memory_session_id);
            "#,
        )?;
        Ok(())
    }

    /// Register a content session, creating the row and assigning a memory
    /// session id on first sight. Idempotent: re-posting the same content
    /// session returns the existing record.
    pub fn register_content_session(
        &self,
        content_session_id: &str,
        project: Option<&str>,
    ) -> Result<SessionRecord> {
        let conn = self.conn()?;

        // INSERT OR IGNORE makes concurrent registrations of the same
        // content session converge on one row; the generated memory id is
        // simply discarded when the row already exists.
        let now = now_epoch_ms();
        let memory_session_id = Self::generate_memory_session_id(now);
        conn.execute(
            "INSERT OR IGNORE INTO sessions
                 (content_session_id, memory_session_id, project, started_at_epoch)
             VALUES (?1, ?2, ?3, ?4)",
            params![content_session_id, memory_session_id, project, now],
        )?;

        let record = conn
            .query_row(
                "SELECT id, content_session_id, memory_session_id, project
                 FROM sessions WHERE content_session_id = ?1",
                params![content_session_id],
                Self::map_session_row,
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("Session row vanished after insert"))?;
        Ok(record)
    }

    /// Memory session ids are timestamp + short random suffix, unique enough
    /// for a single-host store without pulling in a UUID dependency.
    fn generate_memory_session_id(now_ms: i64) -> String {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};

        let random = RandomState::new().build_hasher().finish();
        format!("mem-{}-{:04x}", now_ms, random & 0xFFFF)
    }

    fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get(0)?,
            content_session_id: row.get(1)?,
            memory_session_id: row.get(2)?,
            project: row.get(3)?,
        })
    }
}

impl SessionStore for SqliteMemoryStore {
    fn get_session_by_id(&self, session_db_id: i64) -> Result<Option<SessionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, content_session_id, memory_session_id, project
                 FROM sessions WHERE id = ?1",
                params![session_db_id],
                Self::map_session_row,
            )
            .optional()?;
        Ok(record)
    }

    fn store_observations(
        &self,
        memory_session_id: &str,
        project: Option<&str>,
        observations: &[Observation],
        summary: Option<&SessionSummary>,
        prompt_number: Option<i64>,
        discovery_tokens: i64,
    ) -> Result<StoredBatch> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_epoch_ms();

        let mut batch = StoredBatch::default();
        for obs in observations {
            tx.execute(
                "INSERT INTO observations
                     (memory_session_id, project, kind, title, subtitle, facts, narrative,
                      concepts, files_read, files_modified, prompt_number, discovery_tokens,
                      created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    memory_session_id,
                    project,
                    obs.kind,
                    obs.title,
                    obs.subtitle,
                    serde_json::to_string(&obs.facts)?,
                    obs.narrative,
                    serde_json::to_string(&obs.concepts)?,
                    serde_json::to_string(&obs.files_read)?,
                    serde_json::to_string(&obs.files_modified)?,
                    prompt_number,
                    discovery_tokens,
                    now,
                ],
            )?;
            batch.observation_ids.push(tx.last_insert_rowid());
        }

        if let Some(summary) = summary {
            tx.execute(
                "INSERT INTO summaries
                     (memory_session_id, project, request, investigated, learned, completed,
                      next_steps, notes, created_at_epoch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    memory_session_id,
                    project,
                    summary.request,
                    summary.investigated,
                    summary.learned,
                    summary.completed,
                    summary.next_steps,
                    summary.notes,
                    now,
                ],
            )?;
            batch.summary_id = Some(tx.last_insert_rowid());
        }

        tx.commit()?;
        Ok(batch)
    }

    fn get_recent_observations(
        &self,
        project: &str,
        limit: usize,
    ) -> Result<Vec<RecentObservation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, title, subtitle FROM observations
             WHERE project = ?1
             ORDER BY created_at_epoch DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project, limit as i64], |row| {
            let kind: String = row.get(0)?;
            let title: String = row.get(1)?;
            let subtitle: Option<String> = row.get(2)?;
            Ok(RecentObservation {
                kind,
                text: match subtitle {
                    Some(sub) if !sub.is_empty() => format!("{}: {}", title, sub),
                    _ => title,
                },
            })
        })?;

        let mut recent = Vec::new();
        for row in rows {
            recent.push(row?);
        }
        Ok(recent)
    }
}
