//! SQLite write-through store for the critical tier of the message bus.
//!
//! # Storage layout
//!
//! | table | column | type | description |
//! |-------|--------|------|-------------|
//! | `critical_events` | sequence | INTEGER | bus sequence number, primary key |
//! | | timestamp_us | INTEGER | publish time (µs since epoch) |
//! | | topic | TEXT | hierarchical topic |
//! | | body | TEXT | JSON-encoded [`BusEvent`] |
//! | `consumer_cursors` | group_name | TEXT | consumer group, primary key |
//! | | sequence | INTEGER | highest committed sequence |
//!
//! # Example
//!
//! ```rust
//! use mower_memory::journal::EventJournal;
//! use mower_middleware::{BusConfig, MessageBus};
//!
//! let journal = EventJournal::open_in_memory().unwrap();
//! let bus = MessageBus::with_journal(BusConfig::default(), Box::new(journal)).unwrap();
//! assert_eq!(bus.critical_backlog(), 0);
//! ```

use std::path::Path;

use mower_middleware::{BusError, CriticalJournal, JournalSnapshot};
use mower_types::BusEvent;
use rusqlite::{Connection, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("event encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<JournalError> for BusError {
    fn from(e: JournalError) -> Self {
        BusError::Journal(e.to_string())
    }
}

/// Durable [`CriticalJournal`] backed by a single SQLite file.
pub struct EventJournal {
    conn: Connection,
}

impl EventJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    pub fn open_in_memory() -> Result<Self, JournalError> {
        let journal = Self {
            conn: Connection::open_in_memory()?,
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<(), JournalError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS critical_events (
                sequence     INTEGER NOT NULL PRIMARY KEY,
                timestamp_us INTEGER NOT NULL,
                topic        TEXT NOT NULL,
                body         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS critical_events_ts
                ON critical_events (timestamp_us);
            CREATE TABLE IF NOT EXISTS consumer_cursors (
                group_name TEXT NOT NULL PRIMARY KEY,
                sequence   INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn append_event(&self, event: &BusEvent) -> Result<(), JournalError> {
        let body = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO critical_events (sequence, timestamp_us, topic, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.sequence as i64,
                event.timestamp_us as i64,
                event.topic,
                body
            ],
        )?;
        Ok(())
    }

    /// Cursors only move forward; an older commit is ignored.
    pub fn commit_cursor(&self, group: &str, sequence: u64) -> Result<(), JournalError> {
        self.conn.execute(
            "INSERT INTO consumer_cursors (group_name, sequence) VALUES (?1, ?2)
             ON CONFLICT(group_name) DO UPDATE
                 SET sequence = MAX(sequence, excluded.sequence)",
            params![group, sequence as i64],
        )?;
        Ok(())
    }

    pub fn events_since(&self, since_us: u64) -> Result<Vec<BusEvent>, JournalError> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM critical_events
             WHERE timestamp_us >= ?1
             ORDER BY sequence ASC",
        )?;
        let bodies = stmt
            .query_map(params![since_us as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(JournalError::from))
            .collect()
    }

    pub fn cursors(&self) -> Result<Vec<(String, u64)>, JournalError> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_name, sequence FROM consumer_cursors ORDER BY group_name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn prune_before(&self, before_us: u64) -> Result<usize, JournalError> {
        Ok(self.conn.execute(
            "DELETE FROM critical_events WHERE timestamp_us < ?1",
            params![before_us as i64],
        )?)
    }

    pub fn len(&self) -> Result<usize, JournalError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM critical_events", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, JournalError> {
        Ok(self.len()? == 0)
    }
}

impl CriticalJournal for EventJournal {
    fn append(&mut self, event: &BusEvent) -> Result<(), BusError> {
        Ok(self.append_event(event)?)
    }

    fn commit(&mut self, group: &str, sequence: u64) -> Result<(), BusError> {
        Ok(self.commit_cursor(group, sequence)?)
    }

    fn load(&mut self, since_us: u64) -> Result<JournalSnapshot, BusError> {
        Ok(JournalSnapshot {
            events: self.events_since(since_us)?,
            cursors: self.cursors()?,
        })
    }

    fn prune(&mut self, before_us: u64) -> Result<usize, BusError> {
        Ok(self.prune_before(before_us)?)
    }
}
