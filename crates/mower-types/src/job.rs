//! Scheduled mowing jobs.
//!
//! ```text
//!   IDLE ──► SCHEDULED ──► RUNNING ──► COMPLETED
//!               ▲  ▲         │  ▲
//!               │  │ retry   ▼  │
//!               │  └───── PAUSED│
//!               │            │  │
//!               └────────────┴──┴──► FAILED
//! ```
//!
//! A job returns to `SCHEDULED` when it is postponed (weather, battery) or
//! when a failed run is queued for retry; only the latter counts against
//! [`ScheduledJob::retry_count`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Idle,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Idle => "IDLE",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the lifecycle allows `self → to`.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Idle, Scheduled)
                | (Scheduled, Idle)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Running, Completed)
                | (Running, Paused)
                | (Running, Failed)
                | (Running, Scheduled)
                | (Paused, Running)
                | (Paused, Scheduled)
                | (Paused, Failed)
                | (Completed, Scheduled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(JobState::Idle),
            "SCHEDULED" => Ok(JobState::Scheduled),
            "RUNNING" => Ok(JobState::Running),
            "PAUSED" => Ok(JobState::Paused),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// What an operator submits to create or update a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    pub name: String,
    /// Five-field cron expression (`min hour dom month dow`), evaluated in UTC.
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub state: JobState,
    /// Failed runs since the last success. Postponements do not count.
    pub retry_count: u32,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Reason for the last postponement, pause or failure.
    pub last_reason: Option<String>,
    /// Coverage pattern of the current run.
    pub pattern_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            schedule: spec.schedule,
            enabled: spec.enabled,
            state: JobState::Idle,
            retry_count: 0,
            next_run: None,
            last_run: None,
            last_reason: None,
            pattern_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn spec(&self) -> JobSpec {
        JobSpec {
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            enabled: self.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        assert!(JobState::Running.can_transition_to(JobState::Paused));
        assert!(JobState::Paused.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Running));
        assert!(!JobState::Idle.can_transition_to(JobState::Running));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
    }

    #[test]
    fn state_names() {
        assert_eq!(serde_json::to_string(&JobState::Paused).unwrap(), "\"PAUSED\"");
        assert_eq!("running".parse::<JobState>(), Ok(JobState::Running));
        assert!("later".parse::<JobState>().is_err());
    }

    #[test]
    fn new_job_starts_idle() {
        let job = ScheduledJob::new(JobSpec {
            name: "front lawn".to_string(),
            schedule: "0 9 * * 1-5".to_string(),
            enabled: true,
        });
        assert_eq!(job.state, JobState::Idle);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.spec().schedule, "0 9 * * 1-5");
    }
}
