//! Write-through persistence hook for the critical tier.
//!
//! The bus never performs storage I/O on the publisher's thread. Appends and
//! offset commits are queued to a dedicated writer thread that owns the
//! [`CriticalJournal`] implementation; the queue is bounded and a full queue
//! is reported to the publisher as [`BusError::JournalBacklog`].

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use mower_types::BusEvent;
use tracing::{debug, error};

use crate::bus::BusError;

/// What a journal hands back on boot.
#[derive(Debug, Default, Clone)]
pub struct JournalSnapshot {
    /// Retained critical events, in sequence order.
    pub events: Vec<BusEvent>,
    /// Highest committed sequence per consumer group.
    pub cursors: Vec<(String, u64)>,
}

/// Durable backing store for critical events and consumer-group offsets.
pub trait CriticalJournal: Send + 'static {
    fn append(&mut self, event: &BusEvent) -> Result<(), BusError>;
    fn commit(&mut self, group: &str, sequence: u64) -> Result<(), BusError>;
    /// Events with `timestamp_us >= since_us` plus every stored cursor.
    fn load(&mut self, since_us: u64) -> Result<JournalSnapshot, BusError>;
    /// Deletes events older than `before_us`; returns how many were removed.
    fn prune(&mut self, before_us: u64) -> Result<usize, BusError>;
}

pub(crate) enum JournalOp {
    Append(BusEvent),
    Commit { group: String, sequence: u64 },
    Prune { before_us: u64 },
}

/// Owns the writer thread; dropping it drains the queue and joins.
pub(crate) struct JournalWriter {
    tx: Option<SyncSender<JournalOp>>,
    handle: Option<JoinHandle<()>>,
}

impl JournalWriter {
    pub(crate) fn spawn(
        mut journal: Box<dyn CriticalJournal>,
        queue_capacity: usize,
    ) -> Result<Self, BusError> {
        let (tx, rx) = mpsc::sync_channel::<JournalOp>(queue_capacity);
        let handle = thread::Builder::new()
            .name("bus-journal".into())
            .spawn(move || {
                for op in rx {
                    let result = match &op {
                        JournalOp::Append(event) => journal.append(event),
                        JournalOp::Commit { group, sequence } => journal.commit(group, *sequence),
                        JournalOp::Prune { before_us } => journal.prune(*before_us).map(|n| {
                            debug!(pruned = n, "critical journal pruned");
                        }),
                    };
                    if let Err(e) = result {
                        error!(error = %e, "critical journal write failed");
                    }
                }
            })
            .map_err(|e| BusError::Journal(format!("failed to spawn writer: {e}")))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn submit(&self, op: JournalOp) -> Result<(), BusError> {
        let Some(tx) = &self.tx else {
            return Err(BusError::Closed);
        };
        tx.try_send(op).map_err(|e| match e {
            TrySendError::Full(_) => BusError::JournalBacklog,
            TrySendError::Disconnected(_) => BusError::Journal("writer thread stopped".into()),
        })
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
