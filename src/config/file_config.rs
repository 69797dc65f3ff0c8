use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub instance_id: Option<String>,
    pub role: Option<String>,

    pub lock: Option<LockConfig>,
    pub queue: Option<QueueConfig>,
    pub jobs: Option<JobsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LockConfig {
    pub acquire_max_wait_ms: Option<u64>,
    pub acquire_retry_delay_ms: Option<u64>,
    pub acquire_jitter_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_deliveries: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub visibility_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub appointment_auto_completion: Option<JobConfig>,
    pub trial_expiry_deactivation: Option<JobConfig>,
    pub review_eligibility_grant: Option<JobConfig>,
}

/// Per-job table. Job-specific keys are ignored by jobs that don't use them.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: Option<bool>,
    pub cron: Option<String>,
    pub lock_ttl_secs: Option<u64>,
    pub batch_size: Option<usize>,
    /// appointment_auto_completion only
    pub grace_minutes: Option<i64>,
    /// review_eligibility_grant only
    pub min_completed_appointments: Option<i64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
