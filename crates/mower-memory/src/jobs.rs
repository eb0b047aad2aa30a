//! Durable storage for [`ScheduledJob`]s so job definitions and their
//! lifecycle state survive a restart.
//!
//! A job that was `RUNNING` or `PAUSED` when the process died is handed back
//! as-is; the scheduler decides what to do with it on boot.

use std::path::Path;

use mower_types::{JobState, ScheduledJob};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum JobStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("job encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(Uuid),
}

pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, JobStoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), JobStoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id         TEXT NOT NULL PRIMARY KEY,
                name       TEXT NOT NULL,
                state      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body       TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Insert or replace the stored copy of `job`.
    pub fn save(&self, job: &ScheduledJob) -> Result<(), JobStoreError> {
        let body = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO scheduled_jobs (id, name, state, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id.to_string(),
                job.name,
                job.state.as_str(),
                job.created_at.to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<ScheduledJob, JobStoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM scheduled_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or(JobStoreError::NotFound(id))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Result<Vec<ScheduledJob>, JobStoreError> {
        self.query("SELECT body FROM scheduled_jobs ORDER BY created_at ASC", [])
    }

    pub fn list_in_state(&self, state: JobState) -> Result<Vec<ScheduledJob>, JobStoreError> {
        self.query(
            "SELECT body FROM scheduled_jobs WHERE state = ?1 ORDER BY created_at ASC",
            params![state.as_str()],
        )
    }

    fn query<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(JobStoreError::from))
            .collect()
    }

    pub fn delete(&self, id: Uuid) -> Result<(), JobStoreError> {
        let n = self
            .conn
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id.to_string()])?;
        if n == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }
}
