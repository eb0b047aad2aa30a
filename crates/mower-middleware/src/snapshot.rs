//! Latest-value channel for the canonical [`RobotState`].
//!
//! Exactly one [`StatePublisher`] exists per process (the control loop owns
//! it). Any number of [`StateReader`]s can read the most recent snapshot
//! without copying it, or wait for the next one.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use mower_types::RobotState;
use tokio::sync::watch;

use crate::bus::BusError;

/// Create the single writer and a first reader for the state snapshot.
pub fn state_channel(initial: RobotState) -> (StatePublisher, StateReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (StatePublisher { tx }, StateReader { rx })
}

/// Write side. Deliberately not `Clone`.
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<Arc<RobotState>>,
}

impl StatePublisher {
    /// Replace the current snapshot and wake every waiting reader.
    pub fn publish(&self, state: RobotState) -> Arc<RobotState> {
        let state = Arc::new(state);
        self.tx.send_replace(Arc::clone(&state));
        state
    }

    pub fn latest(&self) -> Arc<RobotState> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateReader {
    rx: watch::Receiver<Arc<RobotState>>,
}

impl StateReader {
    pub fn latest(&self) -> Arc<RobotState> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait until a snapshot newer than the last one seen is published.
    pub async fn changed(&mut self) -> Result<Arc<RobotState>, BusError> {
        self.rx.changed().await.map_err(|_| BusError::Closed)?;
        Ok(Arc::clone(&self.rx.borrow_and_update()))
    }

    /// Every subsequent snapshot as a stream. Intermediate snapshots may be
    /// skipped by a slow consumer; the latest one is always delivered.
    pub fn into_stream(self) -> BoxStream<'static, Arc<RobotState>> {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.changed().await.ok().map(|s| (s, reader))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_see_latest_snapshot() {
        let (publisher, reader) = state_channel(RobotState::default());
        let mut waiting = publisher.reader();

        let mut next = RobotState::default();
        next.timestamp_us = 10;
        publisher.publish(next);

        assert_eq!(reader.latest().timestamp_us, 10);
        assert_eq!(waiting.changed().await.unwrap().timestamp_us, 10);
    }

    #[tokio::test]
    async fn changed_errors_once_publisher_is_gone() {
        let (publisher, mut reader) = state_channel(RobotState::default());
        drop(publisher);
        assert_eq!(reader.changed().await, Err(BusError::Closed));
    }

    #[tokio::test]
    async fn slow_stream_skips_to_latest() {
        let (publisher, reader) = state_channel(RobotState::default());
        let mut stream = reader.into_stream();
        for ts in 1..=5 {
            let mut s = RobotState::default();
            s.timestamp_us = ts;
            publisher.publish(s);
        }
        assert_eq!(stream.next().await.unwrap().timestamp_us, 5);
    }
}
