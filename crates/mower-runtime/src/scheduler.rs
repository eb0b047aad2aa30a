//! Cron-triggered mowing jobs with pre-start gating and bounded retries.
//!
//! The [`JobScheduler`] is owned by the control loop and never touches the
//! navigation stack itself: [`JobScheduler::tick`] returns
//! [`SchedulerAction`]s and the loop reports outcomes back through
//! [`job_completed`](JobScheduler::job_completed),
//! [`job_failed`](JobScheduler::job_failed) and
//! [`pause_active`](JobScheduler::pause_active).
//!
//! # Gating
//!
//! A due job starts only when every interlock is acknowledged, the robot is
//! `IDLE`, the battery is at or above `min_battery_percent` and the
//! [`WeatherGate`](crate::weather::WeatherGate) is clear. Otherwise the run is
//! postponed by `postpone_minutes`; postponements never count as retries.
//!
//! # Retries
//!
//! A failed run is re-queued after `backoff_minutes[retry_count - 1]` until
//! `max_retries` is used up, after which the job is `FAILED` and the caller
//! receives [`FailureOutcome::Exhausted`] exactly once.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use mower_memory::{JobStore, JobStoreError};
use mower_middleware::MessageBus;
use mower_types::{EventPayload, JobSpec, JobState, NavigationMode, ScheduledJob, topics};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cron::{CronError, CronSchedule};
use crate::weather::WeatherVerdict;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_battery_percent: f64,
    /// Delay before retry `n` is `backoff_minutes[n - 1]`; the last entry
    /// repeats if `max_retries` is larger.
    pub backoff_minutes: Vec<u64>,
    pub max_retries: u32,
    pub postpone_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_battery_percent: 40.0,
            backoff_minutes: vec![30, 60, 120],
            max_retries: 3,
            postpone_minutes: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(0.0..=100.0).contains(&self.min_battery_percent) {
            return Err(SchedulerError::InvalidConfig(format!(
                "min_battery_percent {} not in 0..=100",
                self.min_battery_percent
            )));
        }
        if self.backoff_minutes.is_empty() || self.backoff_minutes[0] == 0 {
            return Err(SchedulerError::InvalidConfig(
                "backoff_minutes must start with a positive delay".to_string(),
            ));
        }
        if self.backoff_minutes.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SchedulerError::InvalidConfig(format!(
                "backoff_minutes {:?} must be strictly increasing",
                self.backoff_minutes
            )));
        }
        if self.postpone_minutes == 0 {
            return Err(SchedulerError::InvalidConfig(
                "postpone_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn backoff(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.backoff_minutes.len().saturating_sub(1));
        let minutes = self.backoff_minutes.get(idx).copied().unwrap_or(30);
        Duration::minutes(minutes as i64)
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] CronError),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job not found: {0}")]
    NotFound(Uuid),
    #[error("job {id} is {state}: {detail}")]
    Conflict {
        id: Uuid,
        state: JobState,
        detail: String,
    },
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tick inputs and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// What the control loop knows at tick time.
#[derive(Debug, Clone)]
pub struct StartConditions {
    pub interlocks_clear: bool,
    pub mode: NavigationMode,
    pub battery_percent: Option<f64>,
    pub weather: WeatherVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Plan a coverage pattern and switch to `AUTONOMOUS` for this job.
    Start { job_id: Uuid },
    /// The paused job may continue on its existing pattern.
    Resume { job_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { attempt: u32, at: DateTime<Utc> },
    /// Retries used up; the job is `FAILED`.
    Exhausted,
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

enum PersistOp {
    Save(Box<ScheduledJob>),
    Delete(Uuid),
}

/// Applies job writes in order on the blocking pool.
struct JobPersister {
    tx: mpsc::UnboundedSender<PersistOp>,
    worker: JoinHandle<()>,
}

impl JobPersister {
    fn spawn(store: JobStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(op) = rx.blocking_recv() {
                let result = match op {
                    PersistOp::Save(job) => store.save(&job),
                    PersistOp::Delete(id) => match store.delete(id) {
                        Err(JobStoreError::NotFound(_)) => Ok(()),
                        other => other,
                    },
                };
                if let Err(e) = result {
                    error!(error = %e, "job store write failed");
                }
            }
        });
        Self { tx, worker }
    }

    fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            error!("job store worker stopped; change not persisted");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobScheduler
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    job: ScheduledJob,
    cron: CronSchedule,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    bus: MessageBus,
    jobs: BTreeMap<Uuid, Entry>,
    persister: Option<JobPersister>,
}

impl JobScheduler {
    /// In-memory scheduler; jobs are lost on restart.
    pub fn new(config: SchedulerConfig, bus: MessageBus) -> Self {
        Self {
            config,
            bus,
            jobs: BTreeMap::new(),
            persister: None,
        }
    }

    /// Scheduler backed by `store`. Stored jobs are loaded and recovered:
    /// a run that was in progress when the process stopped is re-queued to
    /// start as soon as the gate allows.
    pub fn with_store(
        config: SchedulerConfig,
        bus: MessageBus,
        store: JobStore,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        let stored = store.list()?;
        let mut scheduler = Self::new(config, bus);
        for job in stored {
            match CronSchedule::parse(&job.schedule) {
                Ok(cron) => {
                    scheduler.jobs.insert(job.id, Entry { job, cron });
                }
                Err(e) => warn!(job = %job.id, error = %e, "skipping stored job with bad schedule"),
            }
        }
        scheduler.persister = Some(JobPersister::spawn(store));
        scheduler.recover(now);
        Ok(scheduler)
    }

    fn recover(&mut self, now: DateTime<Utc>) {
        let interrupted: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|e| matches!(e.job.state, JobState::Running | JobState::Paused))
            .map(|e| e.job.id)
            .collect();
        for id in interrupted {
            if let Some(entry) = self.jobs.get_mut(&id) {
                let job = &mut entry.job;
                job.state = JobState::Scheduled;
                job.next_run = Some(now);
                job.pattern_id = None;
                job.last_reason = Some("interrupted by restart".to_string());
                job.updated_at = now;
                warn!(job = %id, "interrupted job re-queued");
            }
            self.commit(id, "re-queued after restart");
        }
    }

    /// Wait for pending writes to reach the store.
    pub async fn close(mut self) {
        if let Some(persister) = self.persister.take() {
            drop(persister.tx);
            if let Err(e) = persister.worker.await {
                error!(error = %e, "job store worker panicked");
            }
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── CRUD ────────────────────────────────────────────────────────────────

    pub fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn get(&self, id: Uuid) -> Result<&ScheduledJob, SchedulerError> {
        self.jobs
            .get(&id)
            .map(|e| &e.job)
            .ok_or(SchedulerError::NotFound(id))
    }

    /// The job currently `RUNNING` or `PAUSED`, if any.
    pub fn active(&self) -> Option<&ScheduledJob> {
        self.jobs
            .values()
            .map(|e| &e.job)
            .find(|j| matches!(j.state, JobState::Running | JobState::Paused))
    }

    fn validate_spec(spec: &JobSpec) -> Result<CronSchedule, SchedulerError> {
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("name must not be empty".to_string()));
        }
        Ok(CronSchedule::parse(&spec.schedule)?)
    }

    pub fn create(&mut self, spec: JobSpec, now: DateTime<Utc>) -> Result<ScheduledJob, SchedulerError> {
        let cron = Self::validate_spec(&spec)?;
        let mut job = ScheduledJob::new(spec);
        job.schedule = cron.to_string();
        job.created_at = now;
        let id = job.id;
        self.jobs.insert(id, Entry { job, cron });
        self.arm(id, now);
        info!(job = %id, "job created");
        self.commit(id, "created");
        self.get(id).cloned()
    }

    /// Replace a job's definition. Re-arms it (including a `FAILED` job) from
    /// a clean retry count. Refused while the job is running or paused.
    pub fn update(
        &mut self,
        id: Uuid,
        spec: JobSpec,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let cron = Self::validate_spec(&spec)?;
        let entry = self.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        ensure_inactive(&entry.job, "stop the job before editing it")?;
        entry.job.name = spec.name;
        entry.job.schedule = cron.to_string();
        entry.job.enabled = spec.enabled;
        entry.job.retry_count = 0;
        entry.job.last_reason = None;
        entry.job.state = JobState::Idle;
        entry.cron = cron;
        self.arm(id, now);
        self.commit(id, "updated");
        self.get(id).cloned()
    }

    pub fn delete(&mut self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        let entry = self.jobs.get(&id).ok_or(SchedulerError::NotFound(id))?;
        ensure_inactive(&entry.job, "stop the job before deleting it")?;
        let removed = self.jobs.remove(&id).map(|e| e.job).ok_or(SchedulerError::NotFound(id))?;
        if let Some(p) = &self.persister {
            p.send(PersistOp::Delete(id));
        }
        info!(job = %id, "job deleted");
        Ok(removed)
    }

    /// `IDLE` jobs that are enabled become `SCHEDULED` at their next fire
    /// time; disabled jobs drop back to `IDLE`.
    fn arm(&mut self, id: Uuid, now: DateTime<Utc>) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        let job = &mut entry.job;
        if job.enabled {
            job.state = JobState::Scheduled;
            job.next_run = entry.cron.next_after(now);
        } else {
            job.state = JobState::Idle;
            job.next_run = None;
        }
        job.updated_at = now;
    }

    // ── Operator actions ────────────────────────────────────────────────────

    /// Make a job due immediately. It still has to pass the start gate on
    /// the next tick.
    pub fn start_now(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<ScheduledJob, SchedulerError> {
        if let Some(active) = self.active() {
            if active.id != id {
                return Err(SchedulerError::Conflict {
                    id: active.id,
                    state: active.state,
                    detail: "another job is in progress".to_string(),
                });
            }
        }
        let entry = self.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let job = &mut entry.job;
        match job.state {
            JobState::Idle | JobState::Scheduled | JobState::Completed if job.enabled => {}
            state => {
                return Err(SchedulerError::Conflict {
                    id,
                    state,
                    detail: if job.enabled {
                        "job cannot be started from this state".to_string()
                    } else {
                        "job is disabled".to_string()
                    },
                });
            }
        }
        job.state = JobState::Scheduled;
        job.next_run = Some(now);
        job.updated_at = now;
        self.commit(id, "start requested");
        self.get(id).cloned()
    }

    /// Abandon the current run (or the pending one) and wait for the next
    /// cron fire. Returns the state the job was in.
    pub fn cancel(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<JobState, SchedulerError> {
        let entry = self.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        let previous = entry.job.state;
        if !matches!(previous, JobState::Running | JobState::Paused | JobState::Scheduled) {
            return Err(SchedulerError::Conflict {
                id,
                state: previous,
                detail: "nothing to cancel".to_string(),
            });
        }
        let job = &mut entry.job;
        job.state = JobState::Scheduled;
        job.next_run = entry.cron.next_after(now);
        job.pattern_id = None;
        job.retry_count = 0;
        job.last_reason = Some("cancelled by operator".to_string());
        job.updated_at = now;
        info!(job = %id, from = %previous, "job cancelled");
        self.commit(id, "cancelled by operator");
        Ok(previous)
    }

    // ── Control loop feedback ───────────────────────────────────────────────

    pub fn attach_pattern(&mut self, id: Uuid, pattern_id: Uuid) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.job.pattern_id = Some(pattern_id);
            self.commit(id, "coverage pattern planned");
        }
    }

    /// An interlock fired: pause the running job, if any.
    pub fn pause_active(&mut self, reason: &str, now: DateTime<Utc>) -> Option<Uuid> {
        let id = self
            .jobs
            .values()
            .find(|e| e.job.state == JobState::Running)
            .map(|e| e.job.id)?;
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.job.state = JobState::Paused;
            entry.job.last_reason = Some(reason.to_string());
            entry.job.updated_at = now;
        }
        warn!(job = %id, reason, "job paused");
        self.commit(id, reason);
        Some(id)
    }

    pub fn job_completed(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let entry = self.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        ensure_transition(&entry.job, JobState::Completed)?;
        let job = &mut entry.job;
        job.state = JobState::Completed;
        job.retry_count = 0;
        job.pattern_id = None;
        job.last_reason = None;
        job.next_run = entry.cron.next_after(now);
        job.updated_at = now;
        info!(job = %id, next_run = ?job.next_run, "job completed");
        self.commit(id, "coverage complete");
        Ok(())
    }

    /// A run failed (stall, planning error, lost pattern). Either re-queues
    /// with backoff or marks the job `FAILED`.
    pub fn job_failed(
        &mut self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, SchedulerError> {
        let max_retries = self.config.max_retries;
        let entry = self.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        ensure_transition(&entry.job, JobState::Failed)?;
        let job = &mut entry.job;
        job.pattern_id = None;
        job.last_reason = Some(reason.to_string());
        job.updated_at = now;

        let outcome = if job.retry_count < max_retries {
            job.retry_count += 1;
            let at = now + self.config.backoff(job.retry_count);
            job.state = JobState::Scheduled;
            job.next_run = Some(at);
            warn!(job = %id, attempt = job.retry_count, %at, reason, "job failed, retry scheduled");
            FailureOutcome::Retry {
                attempt: job.retry_count,
                at,
            }
        } else {
            job.state = JobState::Failed;
            job.next_run = None;
            error!(job = %id, retries = job.retry_count, reason, "job failed, retries exhausted");
            FailureOutcome::Exhausted
        };
        self.commit(id, reason);
        Ok(outcome)
    }

    // ── Tick ────────────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: DateTime<Utc>, conditions: &StartConditions) -> Vec<SchedulerAction> {
        self.rearm_completed(now);

        if let Some(active) = self.active() {
            let (id, state) = (active.id, active.state);
            if state == JobState::Paused
                && conditions.interlocks_clear
                && conditions.mode == NavigationMode::Idle
            {
                if let Some(entry) = self.jobs.get_mut(&id) {
                    entry.job.state = JobState::Running;
                    entry.job.last_reason = None;
                    entry.job.updated_at = now;
                }
                info!(job = %id, "job resumed");
                self.commit(id, "resumed");
                return vec![SchedulerAction::Resume { job_id: id }];
            }
            return Vec::new();
        }

        let due = self
            .jobs
            .values()
            .filter(|e| e.job.enabled && e.job.state == JobState::Scheduled)
            .filter_map(|e| e.job.next_run.filter(|t| *t <= now).map(|t| (t, e.job.id)))
            .min();
        let Some((_, id)) = due else {
            return Vec::new();
        };

        if let Some(reason) = self.gate(conditions) {
            let at = now + Duration::minutes(self.config.postpone_minutes as i64);
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.job.next_run = Some(at);
                entry.job.last_reason = Some(reason.clone());
                entry.job.updated_at = now;
            }
            info!(job = %id, %at, reason = %reason, "job postponed");
            self.commit(id, &format!("postponed: {reason}"));
            return Vec::new();
        }

        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.job.state = JobState::Running;
            entry.job.last_run = Some(now);
            entry.job.last_reason = None;
            entry.job.updated_at = now;
        }
        info!(job = %id, "job starting");
        self.commit(id, "starting");
        vec![SchedulerAction::Start { job_id: id }]
    }

    fn rearm_completed(&mut self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|e| e.job.state == JobState::Completed && e.job.enabled)
            .filter(|e| e.job.next_run.is_some_and(|t| t <= now))
            .map(|e| e.job.id)
            .collect();
        for id in due {
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.job.state = JobState::Scheduled;
                entry.job.updated_at = now;
            }
            self.commit(id, "next run due");
        }
    }

    fn gate(&self, c: &StartConditions) -> Option<String> {
        if !c.interlocks_clear {
            return Some("interlocks not acknowledged".to_string());
        }
        if c.mode != NavigationMode::Idle {
            return Some(format!("robot busy in {} mode", c.mode));
        }
        match c.battery_percent {
            None => return Some("battery level unknown".to_string()),
            Some(p) if p < self.config.min_battery_percent => {
                return Some(format!(
                    "battery {p:.0}% below {:.0}%",
                    self.config.min_battery_percent
                ));
            }
            Some(_) => {}
        }
        match &c.weather {
            WeatherVerdict::Postpone { reason } => Some(reason.clone()),
            WeatherVerdict::Clear => None,
        }
    }

    /// Persist and announce the current state of job `id`.
    fn commit(&self, id: Uuid, detail: &str) {
        let Some(entry) = self.jobs.get(&id) else {
            return;
        };
        if let Some(p) = &self.persister {
            p.send(PersistOp::Save(Box::new(entry.job.clone())));
        }
        let payload = EventPayload::Job {
            job_id: id,
            state: entry.job.state,
            detail: detail.to_string(),
        };
        if let Err(e) = self.bus.publish_critical(&topics::job(&id), payload) {
            error!(job = %id, error = %e, "job event not published");
        }
    }
}

fn ensure_inactive(job: &ScheduledJob, detail: &str) -> Result<(), SchedulerError> {
    if matches!(job.state, JobState::Running | JobState::Paused) {
        return Err(SchedulerError::Conflict {
            id: job.id,
            state: job.state,
            detail: detail.to_string(),
        });
    }
    Ok(())
}

fn ensure_transition(job: &ScheduledJob, to: JobState) -> Result<(), SchedulerError> {
    if job.state.can_transition_to(to) && matches!(job.state, JobState::Running | JobState::Paused)
    {
        return Ok(());
    }
    Err(SchedulerError::Conflict {
        id: job.id,
        state: job.state,
        detail: format!("cannot move to {to}"),
    })
}
