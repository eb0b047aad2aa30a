//! Append-only incident archive for diagnostic [`LogBundle`]s.
//!
//! Bundles produced automatically (interlocks, job failures) are kept for
//! seven days; operator-requested bundles are kept until deleted. The whole
//! archive is capped in bytes: when a new bundle would not fit, the oldest
//! automatic bundles are evicted first, and a single bundle that exceeds the
//! cap on its own has its oldest snapshots trimmed.
//!
//! # Storage layout
//!
//! | column | type | description |
//! |--------|------|-------------|
//! | id | TEXT | UUID v4 primary key |
//! | created_at | TEXT | RFC-3339 creation time (UTC) |
//! | trigger | TEXT | short trigger label, e.g. `interlock:tilt_detected` |
//! | retained | INTEGER | 1 for operator-requested bundles |
//! | size_bytes | INTEGER | length of `body` |
//! | body | TEXT | JSON-encoded [`LogBundle`] |

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use mower_types::{BusEvent, DriverHealth, InterlockKind, RobotState};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Default archive cap: 500 MB.
pub const DEFAULT_ARCHIVE_CAP_BYTES: u64 = 500 * 1024 * 1024;

/// Automatic bundles older than this are swept.
pub const AUTOMATIC_RETENTION_DAYS: i64 = 7;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("bundle encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("log bundle not found: {0}")]
    NotFound(Uuid),
    #[error("archive full: {needed} bytes needed, {available} bytes free after evicting automatic bundles")]
    Full { needed: u64, available: u64 },
}

// ─────────────────────────────────────────────────────────────────────────────
// LogBundle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BundleTrigger {
    Interlock { interlock: InterlockKind },
    JobFailed { job_id: Uuid },
    Operator { note: String },
}

impl BundleTrigger {
    /// Operator-requested bundles are exempt from the retention sweep and
    /// from cap eviction.
    pub fn is_operator(&self) -> bool {
        matches!(self, BundleTrigger::Operator { .. })
    }

    pub fn label(&self) -> String {
        match self {
            BundleTrigger::Interlock { interlock } => format!("interlock:{interlock}"),
            BundleTrigger::JobFailed { job_id } => format!("job_failed:{job_id}"),
            BundleTrigger::Operator { .. } => "operator".to_string(),
        }
    }
}

/// Snapshot of recent state and events around an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBundle {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub trigger: BundleTrigger,
    /// Recent fused states, oldest first.
    pub states: Vec<RobotState>,
    /// Recent bus events, oldest first.
    pub events: Vec<BusEvent>,
    pub driver_health: BTreeMap<String, DriverHealth>,
}

impl LogBundle {
    pub fn new(trigger: BundleTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            trigger,
            states: Vec::new(),
            events: Vec::new(),
            driver_health: BTreeMap::new(),
        }
    }

    /// Drop the oldest half of the snapshots. Returns `false` when there is
    /// nothing left to drop.
    fn trim_oldest(&mut self) -> bool {
        if self.states.is_empty() && self.events.is_empty() {
            return false;
        }
        let drop_states = self.states.len().div_ceil(2);
        let drop_events = self.events.len().div_ceil(2);
        self.states.drain(..drop_states);
        self.events.drain(..drop_events);
        true
    }
}

/// Listing row; the body is loaded on demand with [`IncidentArchive::get`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub trigger: String,
    pub retained: bool,
    pub size_bytes: u64,
}

/// Fixed-width UTC timestamps so `ORDER BY created_at` is chronological.
fn sortable(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// IncidentArchive
// ─────────────────────────────────────────────────────────────────────────────

pub struct IncidentArchive {
    conn: Connection,
    cap_bytes: u64,
}

impl IncidentArchive {
    pub fn open(path: impl AsRef<Path>, cap_bytes: u64) -> Result<Self, ArchiveError> {
        let archive = Self {
            conn: Connection::open(path)?,
            cap_bytes,
        };
        archive.init_schema()?;
        Ok(archive)
    }

    pub fn open_in_memory(cap_bytes: u64) -> Result<Self, ArchiveError> {
        let archive = Self {
            conn: Connection::open_in_memory()?,
            cap_bytes,
        };
        archive.init_schema()?;
        Ok(archive)
    }

    fn init_schema(&self) -> Result<(), ArchiveError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS log_bundles (
                id         TEXT NOT NULL PRIMARY KEY,
                created_at TEXT NOT NULL,
                trigger    TEXT NOT NULL,
                retained   INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                body       TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes
    }

    pub fn total_bytes(&self) -> Result<u64, ArchiveError> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM log_bundles",
            [],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Append `bundle`, evicting old automatic bundles if needed.
    pub fn store(&self, mut bundle: LogBundle) -> Result<BundleSummary, ArchiveError> {
        let mut body = serde_json::to_string(&bundle)?;
        while body.len() as u64 > self.cap_bytes && bundle.trim_oldest() {
            body = serde_json::to_string(&bundle)?;
        }
        let size = body.len() as u64;
        if size > self.cap_bytes {
            return Err(ArchiveError::Full {
                needed: size,
                available: self.cap_bytes,
            });
        }

        let evicted = self.make_room(size)?;
        if evicted > 0 {
            info!(evicted, "archive cap reached, oldest automatic bundles evicted");
        }

        let retained = bundle.trigger.is_operator();
        let summary = BundleSummary {
            id: bundle.id,
            created_at: bundle.created_at,
            trigger: bundle.trigger.label(),
            retained,
            size_bytes: size,
        };
        self.conn.execute(
            "INSERT INTO log_bundles (id, created_at, trigger, retained, size_bytes, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.id.to_string(),
                sortable(summary.created_at),
                summary.trigger,
                retained,
                size as i64,
                body
            ],
        )?;
        info!(bundle = %summary.id, trigger = %summary.trigger, size, "log bundle archived");
        Ok(summary)
    }

    fn make_room(&self, size: u64) -> Result<usize, ArchiveError> {
        let mut total = self.total_bytes()?;
        let mut evicted = 0;
        while total + size > self.cap_bytes {
            let oldest: Option<(String, i64)> = self
                .conn
                .query_row(
                    "SELECT id, size_bytes FROM log_bundles
                     WHERE retained = 0 ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, freed)) = oldest else {
                warn!(total, size, cap = self.cap_bytes, "archive full of retained bundles");
                return Err(ArchiveError::Full {
                    needed: size,
                    available: self.cap_bytes.saturating_sub(total),
                });
            };
            self.conn
                .execute("DELETE FROM log_bundles WHERE id = ?1", params![id])?;
            total = total.saturating_sub(freed.max(0) as u64);
            evicted += 1;
        }
        Ok(evicted)
    }

    pub fn get(&self, id: Uuid) -> Result<LogBundle, ArchiveError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM log_bundles WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or(ArchiveError::NotFound(id))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Every bundle, newest first.
    pub fn list(&self) -> Result<Vec<BundleSummary>, ArchiveError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, trigger, retained, size_bytes
             FROM log_bundles ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, created_at, trigger, retained, size) = row?;
            let id = Uuid::parse_str(&id).map_err(|e| {
                rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
            })?;
            let created_at = created_at.parse::<DateTime<Utc>>().map_err(|e| {
                rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text)
            })?;
            out.push(BundleSummary {
                id,
                created_at,
                trigger,
                retained,
                size_bytes: size.max(0) as u64,
            });
        }
        Ok(out)
    }

    pub fn delete(&self, id: Uuid) -> Result<(), ArchiveError> {
        let n = self
            .conn
            .execute("DELETE FROM log_bundles WHERE id = ?1", params![id.to_string()])?;
        if n == 0 {
            return Err(ArchiveError::NotFound(id));
        }
        Ok(())
    }

    /// Remove automatic bundles older than the retention window.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ArchiveError> {
        let cutoff = now - Duration::days(AUTOMATIC_RETENTION_DAYS);
        let removed = self.conn.execute(
            "DELETE FROM log_bundles WHERE retained = 0 AND created_at < ?1",
            params![sortable(cutoff)],
        )?;
        if removed > 0 {
            info!(removed, "expired log bundles swept");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automatic() -> LogBundle {
        LogBundle::new(BundleTrigger::Interlock {
            interlock: InterlockKind::TiltDetected,
        })
    }

    fn operator() -> LogBundle {
        LogBundle::new(BundleTrigger::Operator {
            note: "blade noise".to_string(),
        })
    }

    fn with_states(mut b: LogBundle, n: usize) -> LogBundle {
        b.states = (0..n)
            .map(|i| RobotState {
                timestamp_us: i as u64,
                ..RobotState::default()
            })
            .collect();
        b
    }

    #[test]
    fn store_get_list() {
        let a = IncidentArchive::open_in_memory(DEFAULT_ARCHIVE_CAP_BYTES).unwrap();
        let b = with_states(automatic(), 3);
        let summary = a.store(b.clone()).unwrap();
        assert_eq!(summary.trigger, "interlock:tilt_detected");
        assert!(!summary.retained);
        assert_eq!(a.get(b.id).unwrap(), b);
        assert_eq!(a.list().unwrap().len(), 1);
        assert_eq!(a.total_bytes().unwrap(), summary.size_bytes);
    }

    #[test]
    fn sweep_keeps_operator_bundles() {
        let a = IncidentArchive::open_in_memory(DEFAULT_ARCHIVE_CAP_BYTES).unwrap();
        let mut old_auto = automatic();
        old_auto.created_at = Utc::now() - Duration::days(8);
        let mut old_op = operator();
        old_op.created_at = Utc::now() - Duration::days(30);
        let fresh = automatic();
        a.store(old_auto.clone()).unwrap();
        a.store(old_op.clone()).unwrap();
        a.store(fresh.clone()).unwrap();

        assert_eq!(a.sweep(Utc::now()).unwrap(), 1);
        assert!(matches!(a.get(old_auto.id), Err(ArchiveError::NotFound(_))));
        assert!(a.get(old_op.id).is_ok());
        assert!(a.get(fresh.id).is_ok());
    }

    #[test]
    fn cap_evicts_oldest_automatic_first() {
        let one = serde_json::to_string(&with_states(automatic(), 5)).unwrap().len() as u64;
        let a = IncidentArchive::open_in_memory(one * 2 + one / 2).unwrap();

        let mut first = with_states(automatic(), 5);
        first.created_at = Utc::now() - Duration::hours(2);
        let mut second = with_states(automatic(), 5);
        second.created_at = Utc::now() - Duration::hours(1);
        a.store(first.clone()).unwrap();
        a.store(second.clone()).unwrap();
        a.store(with_states(automatic(), 5)).unwrap();

        assert!(a.get(first.id).is_err());
        assert!(a.get(second.id).is_ok());
        assert!(a.total_bytes().unwrap() <= a.cap_bytes());
    }

    #[test]
    fn oversized_bundle_is_trimmed_to_fit() {
        let small = serde_json::to_string(&with_states(automatic(), 4)).unwrap().len() as u64;
        let a = IncidentArchive::open_in_memory(small).unwrap();
        let big = with_states(automatic(), 64);
        let id = big.id;
        a.store(big).unwrap();
        let stored = a.get(id).unwrap();
        assert!(stored.states.len() <= 4);
        // Newest snapshots survive.
        assert_eq!(stored.states.last().unwrap().timestamp_us, 63);
    }

    #[test]
    fn full_of_retained_bundles_is_an_error() {
        let one = serde_json::to_string(&operator()).unwrap().len() as u64;
        let a = IncidentArchive::open_in_memory(one + 10).unwrap();
        a.store(operator()).unwrap();
        assert!(matches!(a.store(operator()), Err(ArchiveError::Full { .. })));
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let a = IncidentArchive::open_in_memory(DEFAULT_ARCHIVE_CAP_BYTES).unwrap();
        assert!(matches!(a.delete(Uuid::new_v4()), Err(ArchiveError::NotFound(_))));
    }
}
