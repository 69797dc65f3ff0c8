mod file_config;

pub use file_config::{FileConfig, JobConfig, JobsConfig, LockConfig, QueueConfig};

use crate::lock::AcquireOptions;
use crate::queue::DeliveryPolicy;
use crate::scheduler::CronSchedule;
use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

pub const APPOINTMENT_AUTO_COMPLETION: &str = "appointment_auto_completion";
pub const TRIAL_EXPIRY_DEACTIVATION: &str = "trial_expiry_deactivation";
pub const REVIEW_ELIGIBILITY_GRANT: &str = "review_eligibility_grant";

/// Which halves of the coordination layer this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Role {
    /// Cron triggers and queue consumers.
    #[default]
    All,
    /// Only race for ticks and publish work.
    Trigger,
    /// Only consume published work.
    Consumer,
}

impl Role {
    pub fn runs_triggers(&self) -> bool {
        matches!(self, Role::All | Role::Trigger)
    }

    pub fn runs_consumers(&self) -> bool {
        matches!(self, Role::All | Role::Consumer)
    }
}

/// CLI arguments that can be used for config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub instance_id: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub instance_id: String,
    pub role: Role,

    pub acquire_options: AcquireOptions,
    pub delivery_policy: DeliveryPolicy,
    pub visibility_timeout: Duration,

    pub jobs: JobsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub name: &'static str,
    pub enabled: bool,
    pub cron: String,
    pub lock_ttl_secs: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub appointment_auto_completion: JobSettings,
    pub auto_completion_grace_minutes: i64,
    pub trial_expiry_deactivation: JobSettings,
    pub review_eligibility_grant: JobSettings,
    pub review_min_completed_appointments: i64,
}

impl JobsSettings {
    pub fn all(&self) -> [&JobSettings; 3] {
        [
            &self.appointment_auto_completion,
            &self.trial_expiry_deactivation,
            &self.review_eligibility_grant,
        ]
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow!("db_dir must be specified via --db-dir or in config file"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let instance_id = file
            .instance_id
            .or_else(|| cli.instance_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if instance_id.trim().is_empty() {
            bail!("instance_id must not be empty");
        }

        let role = match file.role {
            Some(role) => Role::from_str(&role, true)
                .map_err(|_| anyhow!("Invalid role in config file: {}", role))?,
            None => cli.role,
        };

        let lock = file.lock.unwrap_or_default();
        let defaults = AcquireOptions::default();
        let acquire_options = AcquireOptions {
            max_wait: lock
                .acquire_max_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_wait),
            retry_delay: lock
                .acquire_retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            jitter: lock
                .acquire_jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter),
        };

        let queue = file.queue.unwrap_or_default();
        let defaults = DeliveryPolicy::default();
        let delivery_policy = DeliveryPolicy {
            max_deliveries: queue.max_deliveries.unwrap_or(defaults.max_deliveries),
            poll_interval: queue
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        };
        if delivery_policy.max_deliveries < 1 {
            bail!("queue.max_deliveries must be at least 1");
        }
        let visibility_timeout =
            Duration::from_secs(queue.visibility_timeout_secs.unwrap_or(300));
        if visibility_timeout.is_zero() {
            bail!("queue.visibility_timeout_secs must be positive");
        }

        let jobs_file = file.jobs.unwrap_or_default();
        let auto_completion = jobs_file.appointment_auto_completion.unwrap_or_default();
        let trial_expiry = jobs_file.trial_expiry_deactivation.unwrap_or_default();
        let review = jobs_file.review_eligibility_grant.unwrap_or_default();

        let auto_completion_grace_minutes = auto_completion.grace_minutes.unwrap_or(3);
        if auto_completion_grace_minutes < 0 {
            bail!("grace_minutes must not be negative");
        }
        let review_min_completed_appointments = review.min_completed_appointments.unwrap_or(5);
        if review_min_completed_appointments < 1 {
            bail!("min_completed_appointments must be at least 1");
        }

        let jobs = JobsSettings {
            appointment_auto_completion: resolve_job(
                APPOINTMENT_AUTO_COMPLETION,
                "*/5 * * * *",
                &auto_completion,
            )?,
            auto_completion_grace_minutes,
            trial_expiry_deactivation: resolve_job(
                TRIAL_EXPIRY_DEACTIVATION,
                "0 * * * *",
                &trial_expiry,
            )?,
            review_eligibility_grant: resolve_job(REVIEW_ELIGIBILITY_GRANT, "*/30 * * * *", &review)?,
            review_min_completed_appointments,
        };

        Ok(Self {
            db_dir,
            instance_id,
            role,
            acquire_options,
            delivery_policy,
            visibility_timeout,
            jobs,
        })
    }

    pub fn coordination_db_path(&self) -> PathBuf {
        self.db_dir.join("coordination.db")
    }

    pub fn booking_db_path(&self) -> PathBuf {
        self.db_dir.join("booking.db")
    }
}

fn resolve_job(name: &'static str, default_cron: &str, file: &JobConfig) -> Result<JobSettings> {
    let cron = file.cron.clone().unwrap_or_else(|| default_cron.to_string());
    CronSchedule::parse(&cron).with_context(|| format!("Invalid cron for job {}", name))?;

    let lock_ttl_secs = file.lock_ttl_secs.unwrap_or(60);
    if lock_ttl_secs == 0 {
        bail!("lock_ttl_secs for job {} must be positive", name);
    }
    let batch_size = file.batch_size.unwrap_or(500);
    if batch_size == 0 {
        bail!("batch_size for job {} must be positive", name);
    }

    Ok(JobSettings {
        name,
        enabled: file.enabled.unwrap_or(true),
        cron,
        lock_ttl_secs,
        batch_size,
    })
}
