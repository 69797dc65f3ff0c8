use super::cron::CronSchedule;
use anyhow::{bail, Result};
use std::time::Duration;
use thiserror::Error;

/// Static description of one scheduled job, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub name: String,
    pub cron_schedule: CronSchedule,
    pub lock_key: String,
    pub lock_ttl_secs: u64,
    pub queue_routing_key: String,
}

impl JobDescriptor {
    /// Build a descriptor with the conventional lock key and routing key for
    /// `name`.
    pub fn new(name: &str, cron: &str, lock_ttl_secs: u64) -> Result<Self> {
        if lock_ttl_secs == 0 {
            bail!("Lock TTL for job {} must be positive", name);
        }
        Ok(Self {
            name: name.to_string(),
            cron_schedule: CronSchedule::parse(cron)?,
            lock_key: format!("jobs:{}:trigger-lock", name),
            lock_ttl_secs,
            queue_routing_key: format!("jobs.{}", name),
        })
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Errors that can occur while consuming and executing a job message.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),
    #[error("Malformed work message: {0}")]
    MalformedMessage(String),
    #[error("Job was cancelled")]
    Cancelled,
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl JobError {
    /// Errors that no amount of redelivery can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::UnknownJob(_) | JobError::MalformedMessage(_))
    }
}

/// A run that stopped early, with the records it had already committed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct JobFailure {
    pub error: JobError,
    pub transitioned: u64,
}

impl From<JobError> for JobFailure {
    fn from(error: JobError) -> Self {
        Self {
            error,
            transitioned: 0,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::ExecutionFailed(format!("{:#}", err))
    }
}

impl From<rusqlite::Error> for JobError {
    fn from(err: rusqlite::Error) -> Self {
        JobError::ExecutionFailed(err.to_string())
    }
}
