//! `mower-middleware` – message bus of the mower control core.
//!
//! Routes events between drivers, the control loop, the scheduler and the
//! operator interface without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – two-tier publish/subscribe [`MessageBus`]: best-effort
//!   broadcast plus a retained, acknowledged critical log.
//! - [`topic`] – hierarchical topic names and `+`/`#` wildcard patterns.
//! - [`journal`] – [`CriticalJournal`] persistence hook for the critical tier.
//! - [`snapshot`] – single-writer latest-value channel for `RobotState`.

pub mod bus;
pub mod journal;
pub mod snapshot;
pub mod topic;

pub use bus::{BusConfig, BusError, CriticalConsumer, MessageBus, Subscription};
pub use journal::{CriticalJournal, JournalSnapshot};
pub use snapshot::{StatePublisher, StateReader, state_channel};
pub use topic::TopicPattern;
