//! `mower-memory` – durable storage of the mower control core.
//!
//! Everything that must survive a restart lives in local SQLite files.
//!
//! # Modules
//!
//! - [`journal`] – [`EventJournal`][journal::EventJournal]: write-through
//!   store for the bus critical tier, replayed on boot so at-least-once
//!   delivery survives a process restart.
//! - [`archive`] – [`IncidentArchive`][archive::IncidentArchive]: bounded,
//!   append-only store of diagnostic [`LogBundle`][archive::LogBundle]s with a
//!   retention sweeper.
//! - [`jobs`] – [`JobStore`][jobs::JobStore]: scheduled mowing jobs and their
//!   lifecycle state.

pub mod archive;
pub mod jobs;
pub mod journal;

pub use archive::{
    ArchiveError, BundleSummary, BundleTrigger, DEFAULT_ARCHIVE_CAP_BYTES, IncidentArchive,
    LogBundle,
};
pub use jobs::{JobStore, JobStoreError};
pub use journal::{EventJournal, JournalError};
