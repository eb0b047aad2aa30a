//! Topic-based publish/subscribe bus with two delivery tiers.
//!
//! | Tier | Retention | Guarantee | Under backpressure |
//! |---|---|---|---|
//! | [`DeliveryTier::BestEffort`] | 1 h TTL | at-most-once | oldest dropped per slow subscriber |
//! | [`DeliveryTier::Critical`] | 24 h | at-least-once per consumer group | publish fails, never drops |
//!
//! Best-effort traffic rides a [`tokio::sync::broadcast`] channel so a slow
//! subscriber never blocks the publisher or its peers. Critical events are
//! appended to a retained log; each consumer group keeps a committed offset
//! and a consumer that goes away before acknowledging sees the same events
//! again when its group resubscribes. Critical events are also fanned out
//! on the best-effort channel so passive observers see them.
//!
//! Ordering is by the bus-wide [`BusEvent::sequence`]: a single publisher's
//! events on one topic arrive in publish order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use mower_types::{BusEvent, DeliveryTier, EventPayload, MowerError, now_us};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::journal::{CriticalJournal, JournalOp, JournalWriter};
use crate::topic::{TopicPattern, validate_topic};

/// Minimum spacing between journal prune requests.
const PRUNE_INTERVAL_US: u64 = 60 * 1_000_000;

/// Maximum events pulled from the critical log per lock acquisition.
const FETCH_BATCH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("critical buffer full: {capacity} events retained and none evictable")]
    CriticalBufferFull { capacity: usize },

    #[error("critical journal backlog full")]
    JournalBacklog,

    #[error("journal error: {0}")]
    Journal(String),

    #[error("message bus closed")]
    Closed,
}

impl BusError {
    /// Errors after which the bus can no longer honour its critical-tier
    /// guarantee. The runtime treats these as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::CriticalBufferFull { .. } | BusError::JournalBacklog)
    }
}

impl From<BusError> for MowerError {
    fn from(e: BusError) -> Self {
        MowerError::Channel(e.to_string())
    }
}

/// Capacities and lifetimes for both tiers.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber buffer of the best-effort channel.
    pub best_effort_capacity: usize,
    pub best_effort_ttl: Duration,
    /// Upper bound on retained critical events.
    pub critical_capacity: usize,
    pub critical_retention: Duration,
    /// Bound on queued journal writes.
    pub journal_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            best_effort_capacity: 1024,
            best_effort_ttl: Duration::from_secs(60 * 60),
            critical_capacity: 65_536,
            critical_retention: Duration::from_secs(24 * 60 * 60),
            journal_queue: 4096,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Critical log
// ────────────────────────────────────────────────────────────────────────────

struct CriticalLog {
    events: VecDeque<BusEvent>,
    /// Highest committed sequence per consumer group (0 = nothing yet).
    groups: HashMap<String, u64>,
    last_prune_us: u64,
}

impl CriticalLog {
    /// Drops events that every group has committed or that outlived the
    /// retention window. Returns `true` when something expired by age.
    fn evict(&mut self, now: u64, retention_us: u64) -> bool {
        let cutoff = now.saturating_sub(retention_us);
        let committed_floor = self.groups.values().min().copied();
        let mut expired_any = false;
        while let Some(front) = self.events.front() {
            let expired = front.timestamp_us < cutoff;
            let consumed = committed_floor.is_some_and(|c| front.sequence <= c);
            if !(expired || consumed) {
                break;
            }
            expired_any |= expired;
            self.events.pop_front();
        }
        expired_any
    }

    fn after(&self, position: u64, limit: usize) -> Vec<BusEvent> {
        let start = self.events.partition_point(|e| e.sequence <= position);
        self.events.range(start..).take(limit).cloned().collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MessageBus
// ────────────────────────────────────────────────────────────────────────────

struct Inner {
    config: BusConfig,
    /// Last assigned sequence number.
    sequence: AtomicU64,
    best_effort: broadcast::Sender<BusEvent>,
    critical: Mutex<CriticalLog>,
    critical_head: watch::Sender<u64>,
    journal: Option<JournalWriter>,
}

/// Shared message bus. Clone it cheaply; all clones share the same state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("sequence", &self.inner.sequence.load(Ordering::Relaxed))
            .field("journaled", &self.inner.journal.is_some())
            .finish()
    }
}

impl MessageBus {
    /// In-memory bus. Critical events survive consumer restarts but not a
    /// process restart.
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None, JournalRestore::default())
    }

    /// Bus whose critical tier is written through to `journal`.
    ///
    /// Events younger than the retention window and every group's committed
    /// offset are replayed from the journal before the bus accepts traffic.
    pub fn with_journal(
        config: BusConfig,
        mut journal: Box<dyn CriticalJournal>,
    ) -> Result<Self, BusError> {
        let now = now_us();
        let cutoff = now.saturating_sub(config.critical_retention.as_micros() as u64);
        let pruned = journal.prune(cutoff)?;
        let snapshot = journal.load(cutoff)?;
        let writer = JournalWriter::spawn(journal, config.journal_queue)?;

        let restore = JournalRestore {
            events: snapshot.events,
            cursors: snapshot.cursors,
        };
        let replayed = restore.events.len();
        let groups = restore.cursors.len();
        let bus = Self::build(config, Some(writer), restore);
        info!(replayed, groups, pruned, "critical journal restored");
        Ok(bus)
    }

    fn build(config: BusConfig, journal: Option<JournalWriter>, restore: JournalRestore) -> Self {
        let (best_effort, _) = broadcast::channel(config.best_effort_capacity.max(1));
        let mut events: Vec<BusEvent> = restore.events;
        events.sort_by_key(|e| e.sequence);
        let max_event = events.last().map(|e| e.sequence).unwrap_or(0);
        let groups: HashMap<String, u64> = restore.cursors.into_iter().collect();
        let max_cursor = groups.values().copied().max().unwrap_or(0);
        let last = max_event.max(max_cursor);
        let (critical_head, _) = watch::channel(last);

        Self {
            inner: Arc::new(Inner {
                config,
                sequence: AtomicU64::new(last),
                best_effort,
                critical: Mutex::new(CriticalLog {
                    events: events.into(),
                    groups,
                    last_prune_us: 0,
                }),
                critical_head,
                journal,
            }),
        }
    }

    fn lock_log(&self) -> MutexGuard<'_, CriticalLog> {
        self.inner
            .critical
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_event(&self, topic: &str, tier: DeliveryTier, payload: EventPayload) -> BusEvent {
        BusEvent {
            id: Uuid::new_v4(),
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            topic: topic.to_string(),
            timestamp_us: now_us(),
            tier,
            payload,
        }
    }

    // ── Publishing ─────────────────────────────────────────────────────────

    /// Publish on the best-effort tier. Never blocks; having no subscribers
    /// is not an error. Returns the assigned sequence number.
    pub fn publish(&self, topic: &str, payload: EventPayload) -> Result<u64, BusError> {
        validate_topic(topic)?;
        let event = self.next_event(topic, DeliveryTier::BestEffort, payload);
        let sequence = event.sequence;
        let _ = self.inner.best_effort.send(event);
        Ok(sequence)
    }

    /// Publish on the critical tier.
    ///
    /// Fails with [`BusError::CriticalBufferFull`] when the retained log is
    /// at capacity and no event can be evicted. The event is never dropped
    /// silently.
    pub fn publish_critical(&self, topic: &str, payload: EventPayload) -> Result<u64, BusError> {
        validate_topic(topic)?;
        let capacity = self.inner.config.critical_capacity;
        let retention_us = self.inner.config.critical_retention.as_micros() as u64;

        let event = {
            let mut log = self.lock_log();
            let now = now_us();
            let expired = log.evict(now, retention_us);
            if expired && now.saturating_sub(log.last_prune_us) >= PRUNE_INTERVAL_US {
                log.last_prune_us = now;
                if let Some(journal) = &self.inner.journal {
                    let _ = journal.submit(JournalOp::Prune {
                        before_us: now.saturating_sub(retention_us),
                    });
                }
            }
            if log.events.len() >= capacity {
                error!(topic, capacity, "critical buffer full");
                return Err(BusError::CriticalBufferFull { capacity });
            }
            let event = self.next_event(topic, DeliveryTier::Critical, payload);
            if let Some(journal) = &self.inner.journal {
                journal.submit(JournalOp::Append(event.clone()))?;
            }
            log.events.push_back(event.clone());
            event
        };

        let sequence = event.sequence;
        self.inner.critical_head.send_replace(sequence);
        let _ = self.inner.best_effort.send(event);
        Ok(sequence)
    }

    /// Publish on whichever tier `tier` names.
    pub fn publish_on(
        &self,
        tier: DeliveryTier,
        topic: &str,
        payload: EventPayload,
    ) -> Result<u64, BusError> {
        match tier {
            DeliveryTier::Critical => self.publish_critical(topic, payload),
            DeliveryTier::BestEffort => self.publish(topic, payload),
        }
    }

    // ── Subscribing ────────────────────────────────────────────────────────

    /// Best-effort subscription to every topic matched by `pattern`.
    ///
    /// Only events published after this call are seen.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        Ok(Subscription {
            pattern: TopicPattern::parse(pattern)?,
            receiver: self.inner.best_effort.subscribe(),
            ttl_us: self.inner.config.best_effort_ttl.as_micros() as u64,
            dropped: 0,
        })
    }

    /// At-least-once consumer for `group` on the critical tier.
    ///
    /// A new group starts at the oldest retained event. An existing group
    /// resumes after its last committed offset, so anything delivered but
    /// not acknowledged by a previous consumer is delivered again.
    pub fn subscribe_critical(
        &self,
        group: &str,
        pattern: &str,
    ) -> Result<CriticalConsumer, BusError> {
        let pattern = TopicPattern::parse(pattern)?;
        let position = *self.lock_log().groups.entry(group.to_string()).or_insert(0);
        Ok(CriticalConsumer {
            bus: self.clone(),
            group: group.to_string(),
            pattern,
            position,
            pending: VecDeque::new(),
            unacked: Vec::new(),
            head: self.inner.critical_head.subscribe(),
        })
    }

    /// Number of critical events currently retained.
    pub fn critical_backlog(&self) -> usize {
        self.lock_log().events.len()
    }

    /// Committed offset of `group`, if the group exists.
    pub fn committed(&self, group: &str) -> Option<u64> {
        self.lock_log().groups.get(group).copied()
    }

    fn commit(&self, group: &str, sequence: u64) -> Result<(), BusError> {
        let mut log = self.lock_log();
        let cursor = log.groups.entry(group.to_string()).or_insert(0);
        if sequence <= *cursor {
            return Ok(());
        }
        *cursor = sequence;
        if let Some(journal) = &self.inner.journal {
            journal.submit(JournalOp::Commit {
                group: group.to_string(),
                sequence,
            })?;
        }
        Ok(())
    }

    fn fetch_after(&self, position: u64) -> Vec<BusEvent> {
        self.lock_log().after(position, FETCH_BATCH)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[derive(Default)]
struct JournalRestore {
    events: Vec<BusEvent>,
    cursors: Vec<(String, u64)>,
}

// ────────────────────────────────────────────────────────────────────────────
// Best-effort subscription
// ────────────────────────────────────────────────────────────────────────────

/// Pattern-filtered best-effort receiver.
pub struct Subscription {
    pattern: TopicPattern,
    receiver: broadcast::Receiver<BusEvent>,
    ttl_us: u64,
    dropped: u64,
}

impl Subscription {
    fn accepts(&self, event: &BusEvent) -> bool {
        self.pattern.matches(&event.topic)
            && now_us().saturating_sub(event.timestamp_us) <= self.ttl_us
    }

    /// Wait for the next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => self.note_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(_) => return None,
            }
        }
    }

    fn note_lag(&mut self, n: u64) {
        self.dropped += n;
        warn!(
            pattern = self.pattern.as_str(),
            skipped = n,
            "subscriber lagged, oldest events dropped"
        );
    }

    /// Total events this subscriber lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Adapt into a [`futures_util::Stream`] that ends when the bus closes.
    pub fn into_stream(self) -> BoxStream<'static, BusEvent> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Critical consumer
// ────────────────────────────────────────────────────────────────────────────

/// One member of a consumer group on the critical tier.
///
/// Call [`ack`](Self::ack) once an event has been fully handled. Dropping
/// the consumer with events still unacknowledged leaves the group's offset
/// where it was, so the next consumer of the group receives them again.
pub struct CriticalConsumer {
    bus: MessageBus,
    group: String,
    pattern: TopicPattern,
    /// Last sequence examined by this consumer.
    position: u64,
    pending: VecDeque<BusEvent>,
    /// Delivered but not yet acknowledged, ascending.
    unacked: Vec<u64>,
    head: watch::Receiver<u64>,
}

impl CriticalConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for the next matching critical event.
    pub async fn recv(&mut self) -> Result<BusEvent, BusError> {
        loop {
            if let Some(event) = self.poll_pending()? {
                return Ok(event);
            }
            let _ = self.head.borrow_and_update();
            self.pending = self.bus.fetch_after(self.position).into();
            if self.pending.is_empty() {
                self.head.changed().await.map_err(|_| BusError::Closed)?;
            }
        }
    }

    /// Next matching event already retained, without waiting.
    pub fn try_recv(&mut self) -> Result<Option<BusEvent>, BusError> {
        loop {
            if let Some(event) = self.poll_pending()? {
                return Ok(Some(event));
            }
            self.pending = self.bus.fetch_after(self.position).into();
            if self.pending.is_empty() {
                return Ok(None);
            }
        }
    }

    fn poll_pending(&mut self) -> Result<Option<BusEvent>, BusError> {
        while let Some(event) = self.pending.pop_front() {
            self.position = event.sequence;
            if self.pattern.matches(&event.topic) {
                self.unacked.push(event.sequence);
                return Ok(Some(event));
            }
            // Nothing outstanding: skipped events can be committed as seen.
            if self.unacked.is_empty() {
                self.bus.commit(&self.group, event.sequence)?;
            }
        }
        Ok(None)
    }

    /// Acknowledge `sequence`. The group's offset advances to just before
    /// the oldest event this consumer still holds unacknowledged.
    pub fn ack(&mut self, sequence: u64) -> Result<(), BusError> {
        self.unacked.retain(|&s| s != sequence);
        let committed = match self.unacked.first() {
            Some(&oldest) => oldest - 1,
            None => self.position,
        };
        self.bus.commit(&self.group, committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalSnapshot;
    use mower_types::{InterlockKind, InterlockStatus};
    use std::sync::Mutex as StdMutex;

    fn heartbeat(component: &str) -> EventPayload {
        EventPayload::Heartbeat {
            component: component.to_string(),
        }
    }

    fn interlock(kind: InterlockKind) -> EventPayload {
        EventPayload::Interlock {
            kind,
            status: InterlockStatus::Active,
            detail: String::new(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = MessageBus::default();
        assert_eq!(bus.publish("system/heartbeat/fusion", heartbeat("fusion")), Ok(1));
    }

    #[tokio::test]
    async fn best_effort_filters_by_pattern_and_preserves_order() {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe("system/heartbeat/+").unwrap();

        bus.publish("system/heartbeat/a", heartbeat("a")).unwrap();
        bus.publish("sensors/gps/gps0", heartbeat("x")).unwrap();
        bus.publish("system/heartbeat/b", heartbeat("b")).unwrap();

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.topic, "system/heartbeat/a");
        assert_eq!(second.topic, "system/heartbeat/b");
        assert!(first.sequence < second.sequence);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn invalid_topic_is_rejected() {
        let bus = MessageBus::default();
        assert!(matches!(
            bus.publish("sensors/+/x", heartbeat("x")),
            Err(BusError::InvalidTopic(_))
        ));
        assert!(matches!(
            bus.subscribe("a/#/b"),
            Err(BusError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_events() {
        let bus = MessageBus::new(BusConfig {
            best_effort_capacity: 4,
            ..BusConfig::default()
        });
        let mut sub = bus.subscribe("#").unwrap();
        for i in 0..10 {
            bus.publish(&format!("t/{i}"), heartbeat("x")).unwrap();
        }
        let first = sub.recv().await.unwrap();
        assert_eq!(first.topic, "t/6");
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn expired_best_effort_events_are_skipped() {
        let bus = MessageBus::new(BusConfig {
            best_effort_ttl: Duration::ZERO,
            ..BusConfig::default()
        });
        let mut sub = bus.subscribe("#").unwrap();
        bus.publish("t/old", heartbeat("x")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn critical_events_are_redelivered_until_acked() {
        let bus = MessageBus::default();
        let topic = mower_types::topics::interlock(InterlockKind::TiltDetected);

        let mut consumer = bus.subscribe_critical("safety", "safety/#").unwrap();
        let seq = bus
            .publish_critical(&topic, interlock(InterlockKind::TiltDetected))
            .unwrap();
        let event = consumer.recv().await.unwrap();
        assert_eq!(event.sequence, seq);
        drop(consumer);

        // The consumer crashed before acknowledging: its replacement sees it.
        let mut consumer = bus.subscribe_critical("safety", "safety/#").unwrap();
        let again = consumer.recv().await.unwrap();
        assert_eq!(again.id, event.id);
        consumer.ack(again.sequence).unwrap();
        drop(consumer);

        let mut consumer = bus.subscribe_critical("safety", "safety/#").unwrap();
        assert!(consumer.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn consumer_groups_are_independent() {
        let bus = MessageBus::default();
        let mut a = bus.subscribe_critical("a", "#").unwrap();
        let mut b = bus.subscribe_critical("b", "#").unwrap();
        bus.publish_critical("safety/interlock/emergency_stop", heartbeat("x"))
            .unwrap();

        let ev = a.recv().await.unwrap();
        a.ack(ev.sequence).unwrap();
        assert_eq!(bus.committed("a"), Some(ev.sequence));
        assert_eq!(bus.committed("b"), Some(0));
        assert_eq!(b.recv().await.unwrap().id, ev.id);
    }

    #[tokio::test]
    async fn full_critical_buffer_is_an_error() {
        let bus = MessageBus::new(BusConfig {
            critical_capacity: 2,
            ..BusConfig::default()
        });
        let mut consumer = bus.subscribe_critical("g", "#").unwrap();
        bus.publish_critical("c/1", heartbeat("x")).unwrap();
        bus.publish_critical("c/2", heartbeat("x")).unwrap();

        let err = bus.publish_critical("c/3", heartbeat("x")).unwrap_err();
        assert_eq!(err, BusError::CriticalBufferFull { capacity: 2 });
        assert!(err.is_fatal());

        // Acknowledging frees room.
        let ev = consumer.recv().await.unwrap();
        consumer.ack(ev.sequence).unwrap();
        assert!(bus.publish_critical("c/3", heartbeat("x")).is_ok());
        assert_eq!(bus.critical_backlog(), 2);
    }

    #[tokio::test]
    async fn skipped_events_do_not_pin_the_log() {
        let bus = MessageBus::new(BusConfig {
            critical_capacity: 3,
            ..BusConfig::default()
        });
        let mut consumer = bus.subscribe_critical("estop", "sensors/#").unwrap();
        for i in 0..3 {
            bus.publish_critical(&format!("jobs/{i}"), heartbeat("x")).unwrap();
        }
        assert!(consumer.try_recv().unwrap().is_none());
        assert_eq!(bus.committed("estop"), Some(3));
        assert!(bus.publish_critical("jobs/4", heartbeat("x")).is_ok());
    }

    #[tokio::test]
    async fn critical_consumer_wakes_on_publish() {
        let bus = MessageBus::default();
        let mut consumer = bus.subscribe_critical("late", "#").unwrap();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish_critical("safety/interlock/low_battery", heartbeat("x"))
                .unwrap();
        });
        let ev = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.topic, "safety/interlock/low_battery");
    }

    #[tokio::test]
    async fn critical_events_reach_passive_observers() {
        let bus = MessageBus::default();
        let mut observer = bus.subscribe("safety/#").unwrap();
        bus.publish_critical("safety/interlock/tilt_detected", heartbeat("x"))
            .unwrap();
        let ev = observer.recv().await.unwrap();
        assert_eq!(ev.tier, DeliveryTier::Critical);
    }

    #[tokio::test]
    async fn subscription_as_stream() {
        let bus = MessageBus::default();
        let mut stream = bus.subscribe("jobs/#").unwrap().into_stream();
        bus.publish("jobs/1", heartbeat("x")).unwrap();
        let ev = stream.next().await.unwrap();
        assert_eq!(ev.topic, "jobs/1");
    }

    // ── Journal replay ──────────────────────────────────────────────────

    #[derive(Default)]
    struct MemState {
        events: Vec<BusEvent>,
        cursors: HashMap<String, u64>,
    }

    #[derive(Clone, Default)]
    struct MemJournal(Arc<StdMutex<MemState>>);

    impl CriticalJournal for MemJournal {
        fn append(&mut self, event: &BusEvent) -> Result<(), BusError> {
            self.0.lock().unwrap().events.push(event.clone());
            Ok(())
        }
        fn commit(&mut self, group: &str, sequence: u64) -> Result<(), BusError> {
            self.0
                .lock()
                .unwrap()
                .cursors
                .insert(group.to_string(), sequence);
            Ok(())
        }
        fn load(&mut self, since_us: u64) -> Result<JournalSnapshot, BusError> {
            let state = self.0.lock().unwrap();
            Ok(JournalSnapshot {
                events: state
                    .events
                    .iter()
                    .filter(|e| e.timestamp_us >= since_us)
                    .cloned()
                    .collect(),
                cursors: state
                    .cursors
                    .iter()
                    .map(|(g, s)| (g.clone(), *s))
                    .collect(),
            })
        }
        fn prune(&mut self, before_us: u64) -> Result<usize, BusError> {
            let mut state = self.0.lock().unwrap();
            let before = state.events.len();
            state.events.retain(|e| e.timestamp_us >= before_us);
            Ok(before - state.events.len())
        }
    }

    #[tokio::test]
    async fn unacked_events_survive_a_restart() {
        let journal = MemJournal::default();

        let bus = MessageBus::with_journal(BusConfig::default(), Box::new(journal.clone())).unwrap();
        let mut consumer = bus.subscribe_critical("control", "#").unwrap();
        bus.publish_critical("safety/interlock/emergency_stop", heartbeat("a"))
            .unwrap();
        bus.publish_critical("safety/interlock/tilt_detected", heartbeat("b"))
            .unwrap();
        let first = consumer.recv().await.unwrap();
        consumer.ack(first.sequence).unwrap();
        drop(consumer);
        drop(bus);

        let bus = MessageBus::with_journal(BusConfig::default(), Box::new(journal.clone())).unwrap();
        let mut consumer = bus.subscribe_critical("control", "#").unwrap();
        let replayed = consumer.recv().await.unwrap();
        assert_eq!(replayed.topic, "safety/interlock/tilt_detected");
        assert!(consumer.try_recv().unwrap().is_none());

        // Sequence numbering continues after the replayed events.
        let next = bus.publish("jobs/x", heartbeat("c")).unwrap();
        assert!(next > replayed.sequence);
    }
}
