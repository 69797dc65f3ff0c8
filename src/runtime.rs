//! Process wiring: one scheduler and one consumer per enabled job.

use crate::booking_store::SqliteBookingStore;
use crate::clock::Clock;
use crate::config::{AppConfig, JobSettings};
use crate::coordination_store::{JobRunStore, SqliteCoordinationStore};
use crate::lock::DistributedLock;
use crate::queue::{JobConsumer, WorkQueue};
use crate::reconcile::jobs::{
    AppointmentAutoCompletionJob, ReviewEligibilityGrantJob, TrialExpiryDeactivationJob,
};
use crate::reconcile::{BatchReconciler, ReconcileHandler, ReconcileJob};
use crate::scheduler::{JobDescriptor, JobScheduler, ScheduledTrigger};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Serialises booking schema creation between instances starting together.
const SCHEMA_LOCK_KEY: &str = "jobs:booking-schema:init-lock";
const SCHEMA_LOCK_TTL: Duration = Duration::from_secs(30);

struct RuntimeJob {
    descriptor: JobDescriptor,
    batch_size: usize,
    job: Arc<dyn ReconcileJob>,
}

pub struct JobRuntime {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    coordination: Arc<SqliteCoordinationStore>,
    booking: Arc<SqliteBookingStore>,
}

impl JobRuntime {
    /// Open (creating or migrating as needed) both databases under
    /// `config.db_dir`.
    pub async fn open(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let coordination = Arc::new(
            SqliteCoordinationStore::new(
                config.coordination_db_path(),
                clock.clone(),
                &config.instance_id,
            )?
            .with_visibility_timeout(config.visibility_timeout),
        );

        let lock = DistributedLock::new(coordination.clone());
        let schema_lock = lock
            .acquire(SCHEMA_LOCK_KEY, SCHEMA_LOCK_TTL, config.acquire_options)
            .await?;
        if schema_lock.is_none() {
            warn!("Booking schema lock still held elsewhere, opening the database anyway");
        }
        let booking = SqliteBookingStore::new(config.booking_db_path());
        if let Some(handle) = schema_lock {
            lock.release(&handle)?;
        }
        let booking = Arc::new(booking?);

        Ok(Self::from_parts(config, clock, coordination, booking))
    }

    pub fn from_parts(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        coordination: Arc<SqliteCoordinationStore>,
        booking: Arc<SqliteBookingStore>,
    ) -> Self {
        Self {
            config,
            clock,
            coordination,
            booking,
        }
    }

    pub fn coordination(&self) -> &Arc<SqliteCoordinationStore> {
        &self.coordination
    }

    pub fn booking(&self) -> &Arc<SqliteBookingStore> {
        &self.booking
    }

    fn enabled_jobs(&self) -> Result<Vec<RuntimeJob>> {
        let jobs = &self.config.jobs;
        let candidates: [(&JobSettings, Arc<dyn ReconcileJob>); 3] = [
            (
                &jobs.appointment_auto_completion,
                Arc::new(AppointmentAutoCompletionJob::new(chrono::Duration::minutes(
                    jobs.auto_completion_grace_minutes,
                ))),
            ),
            (
                &jobs.trial_expiry_deactivation,
                Arc::new(TrialExpiryDeactivationJob),
            ),
            (
                &jobs.review_eligibility_grant,
                Arc::new(ReviewEligibilityGrantJob::new(
                    jobs.review_min_completed_appointments,
                )),
            ),
        ];

        let mut enabled = Vec::new();
        for (settings, job) in candidates {
            if !settings.enabled {
                info!("Job {} is disabled", settings.name);
                continue;
            }
            let descriptor =
                JobDescriptor::new(settings.name, &settings.cron, settings.lock_ttl_secs)
                    .with_context(|| format!("Invalid settings for job {}", settings.name))?;
            enabled.push(RuntimeJob {
                descriptor,
                batch_size: settings.batch_size,
                job,
            });
        }
        Ok(enabled)
    }

    /// Scheduler with one lock-guarded trigger per enabled job.
    pub fn build_scheduler(&self) -> Result<JobScheduler> {
        let lock = DistributedLock::new(self.coordination.clone());
        let queue: Arc<dyn WorkQueue> = self.coordination.clone();
        let mut scheduler = JobScheduler::new(self.clock.clone());
        for job in self.enabled_jobs()? {
            scheduler.register_trigger(ScheduledTrigger::new(
                job.descriptor,
                lock.clone(),
                queue.clone(),
                &self.config.instance_id,
            ));
        }
        Ok(scheduler)
    }

    /// One single-in-flight consumer per enabled job.
    pub fn build_consumers(&self) -> Result<Vec<JobConsumer>> {
        let queue: Arc<dyn WorkQueue> = self.coordination.clone();
        let run_store: Arc<dyn JobRunStore> = self.coordination.clone();
        let consumers = self
            .enabled_jobs()?
            .into_iter()
            .map(|job| {
                let handler = ReconcileHandler::new(
                    job.job,
                    BatchReconciler::new(job.batch_size),
                    self.booking.clone(),
                    self.clock.clone(),
                );
                JobConsumer::new(
                    queue.clone(),
                    run_store.clone(),
                    Arc::new(handler),
                    job.descriptor.queue_routing_key,
                    self.config.delivery_policy,
                )
            })
            .collect();
        Ok(consumers)
    }

    /// Run this instance's role until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let role = self.config.role;
        info!(
            "Starting job runtime as instance {} (role {:?})",
            self.config.instance_id, role
        );

        match self.coordination.mark_stale_runs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale job runs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale job runs: {:#}", e);
            }
        }

        let mut tasks = JoinSet::new();
        if role.runs_triggers() {
            let scheduler = self.build_scheduler()?;
            tasks.spawn(scheduler.run(shutdown.clone()));
        }
        if role.runs_consumers() {
            for consumer in self.build_consumers()? {
                tasks.spawn(consumer.run(shutdown.clone()));
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Job runtime task failed: {}", e);
            }
        }
        info!("Job runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CliConfig, FileConfig, Role};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn config(dir: &TempDir, toml: &str) -> AppConfig {
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            instance_id: Some("node-a".to_string()),
            role: Role::All,
        };
        let file: FileConfig = toml::from_str(toml).unwrap();
        AppConfig::resolve(&cli, Some(file)).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_both_databases() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "");
        let runtime = JobRuntime::open(config.clone(), Arc::new(crate::clock::SystemClock))
            .await
            .unwrap();

        assert!(config.coordination_db_path().exists());
        assert!(config.booking_db_path().exists());
        assert_eq!(runtime.build_consumers().unwrap().len(), 3);

        // the schema lock was released
        let lock = DistributedLock::new(runtime.coordination().clone());
        assert!(lock
            .try_acquire(SCHEMA_LOCK_KEY, SCHEMA_LOCK_TTL)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_disabled_jobs_are_not_wired() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let config = config(
            &dir,
            "[jobs.trial_expiry_deactivation]\nenabled = false\n",
        );
        let runtime = JobRuntime::from_parts(
            config,
            clock.clone(),
            Arc::new(SqliteCoordinationStore::in_memory(clock.clone()).unwrap()),
            Arc::new(SqliteBookingStore::in_memory().unwrap()),
        );

        assert_eq!(runtime.build_scheduler().unwrap().job_count(), 2);
        let keys: Vec<String> = runtime
            .build_consumers()
            .unwrap()
            .iter()
            .map(|c| c.routing_key().to_string())
            .collect();
        assert_eq!(
            keys,
            vec!["jobs.appointment_auto_completion", "jobs.review_eligibility_grant"]
        );
    }

    #[test]
    fn test_tick_flows_from_scheduler_to_consumer() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 30).unwrap(),
        ));
        let runtime = JobRuntime::from_parts(
            config(&dir, ""),
            clock.clone(),
            Arc::new(SqliteCoordinationStore::in_memory(clock.clone()).unwrap()),
            Arc::new(SqliteBookingStore::in_memory().unwrap()),
        );
        let mut scheduler = runtime.build_scheduler().unwrap();

        // 08:05 fires the five-minute job only
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(scheduler.run_pending(), 1);
        let queue = runtime.coordination().clone();
        assert_eq!(queue.pending_count("jobs.appointment_auto_completion").unwrap(), 1);
        assert_eq!(queue.pending_count("jobs.trial_expiry_deactivation").unwrap(), 0);

        let consumers = runtime.build_consumers().unwrap();
        let token = CancellationToken::new();
        let outcome = consumers[0].process_next(&token).unwrap().unwrap();
        assert!(matches!(
            outcome,
            crate::queue::ConsumeOutcome::Completed { transitioned: 0, .. }
        ));
        assert_eq!(queue.pending_count("jobs.appointment_auto_completion").unwrap(), 0);

        let history = runtime
            .coordination()
            .get_job_history("appointment_auto_completion", 10)
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].triggered_by, "schedule:node-a");
    }
}
