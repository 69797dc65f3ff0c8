use super::job::JobDescriptor;
use super::trigger::ScheduledTrigger;
use crate::clock::Clock;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work performed when a job's cron schedule fires, given the tick time.
pub type TickFn = Box<dyn Fn(DateTime<Utc>) -> Result<()> + Send + Sync>;

/// Longest the scheduler sleeps without re-reading the clock.
const MAX_SLEEP: Duration = Duration::from_secs(60);

struct ScheduledEntry {
    descriptor: JobDescriptor,
    tick: TickFn,
    next_run: Option<DateTime<Utc>>,
}

/// Per-process owner of every job's timer.
///
/// All time is read from the injected [`Clock`], so tests drive ticks with
/// [`run_pending`](Self::run_pending) and a manual clock instead of sleeping.
/// Ticks missed while the process was busy or suspended are coalesced into
/// one.
pub struct JobScheduler {
    clock: Arc<dyn Clock>,
    entries: Vec<ScheduledEntry>,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    /// Register a job with an arbitrary tick function.
    pub fn register(&mut self, descriptor: JobDescriptor, tick: TickFn) {
        let next_run = descriptor.cron_schedule.next_after(self.clock.now());
        match next_run {
            Some(at) => info!(
                "Registering job {} ({}), first tick at {}",
                descriptor.name, descriptor.cron_schedule, at
            ),
            None => warn!(
                "Job {} has a cron schedule that never fires: {}",
                descriptor.name, descriptor.cron_schedule
            ),
        }
        self.entries.push(ScheduledEntry {
            descriptor,
            tick,
            next_run,
        });
    }

    /// Register a job whose tick fires a [`ScheduledTrigger`].
    pub fn register_trigger(&mut self, trigger: ScheduledTrigger) {
        let descriptor = trigger.descriptor().clone();
        self.register(
            descriptor,
            Box::new(move |tick| trigger.fire(tick).map(|_| ())),
        );
    }

    pub fn job_count(&self) -> usize {
        self.entries.len()
    }

    /// Earliest upcoming tick over all jobs.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().filter_map(|e| e.next_run).min()
    }

    /// Fire every job whose tick is due and schedule its next one. Returns
    /// how many ticks fired. A failing tick is logged and does not stop the
    /// others.
    pub fn run_pending(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for entry in &mut self.entries {
            let Some(due) = entry.next_run else {
                continue;
            };
            if due > now {
                continue;
            }
            fired += 1;
            if let Err(e) = (entry.tick)(due) {
                error!("Tick {} of job {} failed: {:#}", due, entry.descriptor.name, e);
            }
            entry.next_run = entry.descriptor.cron_schedule.next_after(now);
        }
        fired
    }

    fn sleep_duration(&self) -> Duration {
        match self.next_wakeup() {
            Some(at) => (at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP),
            None => MAX_SLEEP,
        }
    }

    /// Run until `shutdown` is cancelled. Ticks execute on the blocking pool
    /// since they talk to the coordination store synchronously.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting job scheduler with {} jobs", self.entries.len());
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let result = tokio::task::spawn_blocking(move || {
                let fired = self.run_pending();
                (self, fired)
            })
            .await;
            self = match result {
                Ok((scheduler, fired)) => {
                    if fired > 0 {
                        debug!("Scheduler fired {} ticks", fired);
                    }
                    scheduler
                }
                Err(e) => {
                    error!("Scheduler tick task panicked: {}", e);
                    return;
                }
            };

            let sleep = self.sleep_duration();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("Job scheduler stopped");
    }
}
