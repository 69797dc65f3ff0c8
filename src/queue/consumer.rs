use super::{Delivery, WorkMessage, WorkQueue};
use crate::coordination_store::{JobRunStatus, JobRunStore};
use crate::metrics;
use crate::scheduler::{JobError, JobFailure};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes the work behind one routing key.
pub trait JobHandler: Send + Sync {
    /// Job id expected in every [`WorkMessage`] on this handler's key.
    fn job_id(&self) -> &str;

    /// Run the job once. Returns how many records were transitioned; a
    /// failure reports those it committed before stopping.
    ///
    /// Called from a blocking context; long runs should poll `cancellation`
    /// and fail with [`JobError::Cancelled`].
    fn handle(&self, message: &WorkMessage, cancellation: &CancellationToken)
        -> Result<u64, JobFailure>;
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// Deliveries after which a failing message is dead-lettered instead of
    /// requeued.
    pub max_deliveries: u32,
    /// Sleep between polls of an empty or busy queue.
    pub poll_interval: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Completed { run_id: i64, transitioned: u64 },
    Requeued { run_id: i64, error: String },
    DeadLettered { reason: String },
}

/// Single-in-flight consumer for one job's routing key.
#[derive(Clone)]
pub struct JobConsumer {
    queue: Arc<dyn WorkQueue>,
    run_store: Arc<dyn JobRunStore>,
    handler: Arc<dyn JobHandler>,
    routing_key: String,
    policy: DeliveryPolicy,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        run_store: Arc<dyn JobRunStore>,
        handler: Arc<dyn JobHandler>,
        routing_key: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            queue,
            run_store,
            handler,
            routing_key: routing_key.into(),
            policy,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Claim and process at most one delivery.
    ///
    /// Returns `Ok(None)` when nothing was receivable. Handler failures are
    /// not errors here: they end up as a requeue or a dead letter. `Err` is
    /// reserved for the queue or run store failing.
    pub fn process_next(&self, cancellation: &CancellationToken) -> Result<Option<ConsumeOutcome>> {
        let Some(delivery) = self.queue.receive(&self.routing_key)? else {
            return Ok(None);
        };
        let job_id = self.handler.job_id();

        let message = match WorkMessage::from_payload(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                let err = JobError::MalformedMessage(e.to_string());
                return self.dead_letter(&delivery, &err).map(Some);
            }
        };
        if message.job != job_id {
            let err = JobError::UnknownJob(message.job.clone());
            return self.dead_letter(&delivery, &err).map(Some);
        }

        let run_id = self
            .run_store
            .record_run_start(job_id, &message.triggered_by)?;
        info!(
            "Running job {} (run {}, delivery {} attempt {}, trigger {})",
            job_id, run_id, delivery.id, delivery.delivery_count, message.trigger_id
        );
        let started = Instant::now();
        let result = self.handler.handle(&message, cancellation);
        let elapsed = started.elapsed();

        match result {
            Ok(transitioned) => {
                self.run_store
                    .record_run_finish(run_id, JobRunStatus::Completed, transitioned, None)?;
                if !self.queue.ack(&delivery)? {
                    warn!(
                        "Delivery {} of job {} was reclaimed before ack; it will run again",
                        delivery.id, job_id
                    );
                }
                metrics::record_run(job_id, JobRunStatus::Completed.as_str(), elapsed);
                info!(
                    "Job {} completed in {:?}, {} records transitioned",
                    job_id, elapsed, transitioned
                );
                Ok(Some(ConsumeOutcome::Completed {
                    run_id,
                    transitioned,
                }))
            }
            Err(JobFailure {
                error: JobError::Cancelled,
                transitioned,
            }) => {
                self.run_store.record_run_finish(
                    run_id,
                    JobRunStatus::Cancelled,
                    transitioned,
                    None,
                )?;
                // an interrupted run does not use up one of the message's deliveries
                self.queue.release(&delivery)?;
                metrics::record_run(job_id, JobRunStatus::Cancelled.as_str(), elapsed);
                info!(
                    "Job {} cancelled after {} records transitioned, message released",
                    job_id, transitioned
                );
                Ok(Some(ConsumeOutcome::Requeued {
                    run_id,
                    error: JobError::Cancelled.to_string(),
                }))
            }
            Err(JobFailure {
                error: err,
                transitioned,
            }) => {
                let exhausted = delivery.delivery_count >= self.policy.max_deliveries;
                if err.is_permanent() || exhausted {
                    self.run_store.record_run_finish(
                        run_id,
                        JobRunStatus::DeadLettered,
                        transitioned,
                        Some(err.to_string()),
                    )?;
                    metrics::record_run(job_id, JobRunStatus::DeadLettered.as_str(), elapsed);
                    self.dead_letter(&delivery, &err).map(Some)
                } else {
                    self.run_store.record_run_finish(
                        run_id,
                        JobRunStatus::Failed,
                        transitioned,
                        Some(err.to_string()),
                    )?;
                    self.queue.requeue(&delivery)?;
                    metrics::record_run(job_id, JobRunStatus::Failed.as_str(), elapsed);
                    warn!(
                        "Job {} failed on delivery {}/{}, requeued: {}",
                        job_id, delivery.delivery_count, self.policy.max_deliveries, err
                    );
                    Ok(Some(ConsumeOutcome::Requeued {
                        run_id,
                        error: err.to_string(),
                    }))
                }
            }
        }
    }

    fn dead_letter(&self, delivery: &Delivery, err: &JobError) -> Result<ConsumeOutcome> {
        let reason = err.to_string();
        self.queue.dead_letter(delivery, &reason)?;
        metrics::record_dead_letter(self.handler.job_id());
        error!(
            "Dead-lettered delivery {} on {} after {} attempt(s): {}",
            delivery.id, delivery.routing_key, delivery.delivery_count, reason
        );
        Ok(ConsumeOutcome::DeadLettered { reason })
    }

    /// Poll the queue until `shutdown` is cancelled.
    ///
    /// Each delivery is processed on the blocking pool; the next poll starts
    /// only after it finished, so runs of this job never overlap within the
    /// process, and the queue's in-flight rule keeps them apart across
    /// processes.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Consumer for {} started", self.routing_key);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let consumer = self.clone();
            let token = shutdown.child_token();
            let result =
                tokio::task::spawn_blocking(move || consumer.process_next(&token)).await;

            let drain = match result {
                Ok(Ok(Some(ConsumeOutcome::Completed { .. })))
                | Ok(Ok(Some(ConsumeOutcome::DeadLettered { .. }))) => true,
                Ok(Ok(Some(ConsumeOutcome::Requeued { .. }))) | Ok(Ok(None)) => false,
                Ok(Err(e)) => {
                    error!("Consumer for {} failed: {:#}", self.routing_key, e);
                    false
                }
                Err(e) => {
                    error!("Consumer task for {} panicked: {}", self.routing_key, e);
                    false
                }
            };
            if drain {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }
        }
        debug!("Consumer for {} stopped", self.routing_key);
    }
}
