use super::job::JobDescriptor;
use crate::lock::DistributedLock;
use crate::metrics;
use crate::queue::{WorkMessage, WorkQueue};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This instance won the tick and enqueued one work message.
    Published { message_id: i64, trigger_id: String },
    /// The lock was held elsewhere; another instance owns this tick.
    Skipped,
}

/// Lock-guarded publisher for one job.
///
/// A trigger never runs the job itself. On each tick it races the other
/// instances for the job's lock, and only the winner publishes a work
/// message, releasing the lock right after. The lock TTL therefore only has
/// to cover a publish, not a reconciliation run.
pub struct ScheduledTrigger {
    descriptor: JobDescriptor,
    lock: DistributedLock,
    queue: Arc<dyn WorkQueue>,
    instance_id: String,
}

impl ScheduledTrigger {
    pub fn new(
        descriptor: JobDescriptor,
        lock: DistributedLock,
        queue: Arc<dyn WorkQueue>,
        instance_id: &str,
    ) -> Self {
        Self {
            descriptor,
            lock,
            queue,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// Handle the tick scheduled for `tick`.
    pub fn fire(&self, tick: DateTime<Utc>) -> Result<TriggerOutcome> {
        let job = self.descriptor.name.as_str();
        let handle = match self
            .lock
            .try_acquire(&self.descriptor.lock_key, self.descriptor.lock_ttl())
        {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!("Tick {} of {} is owned by another instance", tick, job);
                metrics::record_trigger_attempt(job, "skipped");
                return Ok(TriggerOutcome::Skipped);
            }
            Err(e) => {
                metrics::record_trigger_attempt(job, "error");
                return Err(e.context(format!("Failed to acquire trigger lock for {}", job)));
            }
        };

        let message = WorkMessage {
            job: job.to_string(),
            triggered_at: tick.timestamp(),
            trigger_id: Uuid::new_v4().to_string(),
            triggered_by: format!("schedule:{}", self.instance_id),
        };
        let published = message
            .to_payload()
            .and_then(|payload| self.queue.publish(&self.descriptor.queue_routing_key, &payload))
            .with_context(|| format!("Failed to publish work message for {}", job));

        // released even when publishing failed, the next tick retries
        if let Err(e) = self.lock.release(&handle) {
            warn!(
                "Failed to release trigger lock {}, it will expire in {}s: {:#}",
                handle.key, self.descriptor.lock_ttl_secs, e
            );
        }

        match published {
            Ok(message_id) => {
                metrics::record_trigger_attempt(job, "published");
                info!(
                    "Published {} for tick {} (message {}, trigger {})",
                    job, tick, message_id, message.trigger_id
                );
                Ok(TriggerOutcome::Published {
                    message_id,
                    trigger_id: message.trigger_id,
                })
            }
            Err(e) => {
                metrics::record_trigger_attempt(job, "error");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::InMemoryLockStore;
    use crate::queue::InMemoryWorkQueue;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        lock: DistributedLock,
        queue: Arc<InMemoryWorkQueue>,
        descriptor: JobDescriptor,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        Harness {
            lock: DistributedLock::new(Arc::new(InMemoryLockStore::new(clock.clone()))),
            queue: Arc::new(InMemoryWorkQueue::new(clock, Duration::from_secs(300))),
            descriptor: JobDescriptor::new("appointment_auto_completion", "*/5 * * * *", 60)
                .unwrap(),
        }
    }

    fn tick(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, minute, 0).unwrap()
    }

    fn trigger(h: &Harness, instance: &str) -> ScheduledTrigger {
        ScheduledTrigger::new(h.descriptor.clone(), h.lock.clone(), h.queue.clone(), instance)
    }

    #[test]
    fn test_winner_publishes_one_message_and_releases() {
        let h = harness();
        let tick = tick(5);

        let outcome = trigger(&h, "node-a").fire(tick).unwrap();
        assert!(matches!(outcome, TriggerOutcome::Published { .. }));
        assert_eq!(h.queue.pending_count("jobs.appointment_auto_completion").unwrap(), 1);

        let delivery = h
            .queue
            .receive("jobs.appointment_auto_completion")
            .unwrap()
            .unwrap();
        let message = WorkMessage::from_payload(&delivery.payload).unwrap();
        assert_eq!(message.job, "appointment_auto_completion");
        assert_eq!(message.triggered_at, tick.timestamp());
        assert_eq!(message.triggered_by, "schedule:node-a");

        // lock was released after publishing
        assert!(h
            .lock
            .try_acquire(&h.descriptor.lock_key, Duration::from_secs(60))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_tick_skipped_while_lock_held_elsewhere() {
        let h = harness();
        let held = h
            .lock
            .try_acquire(&h.descriptor.lock_key, Duration::from_secs(60))
            .unwrap()
            .unwrap();

        let outcome = trigger(&h, "node-b").fire(tick(5)).unwrap();
        assert_eq!(outcome, TriggerOutcome::Skipped);
        assert_eq!(h.queue.pending_count("jobs.appointment_auto_completion").unwrap(), 0);

        // the skipped trigger did not touch the other holder's lock
        assert!(h.lock.release(&held).unwrap());
    }

    #[test]
    fn test_trigger_ids_are_unique() {
        let h = harness();
        let t = trigger(&h, "node-a");
        let first = t.fire(tick(5)).unwrap();
        let second = t.fire(tick(10)).unwrap();
        match (first, second) {
            (
                TriggerOutcome::Published { trigger_id: a, message_id: ma },
                TriggerOutcome::Published { trigger_id: b, message_id: mb },
            ) => {
                assert_ne!(a, b);
                assert_ne!(ma, mb);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }
}
