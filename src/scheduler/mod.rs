//! Cron-driven triggering of scheduled jobs.
//!
//! Every process runs a [`JobScheduler`] holding one [`ScheduledTrigger`]
//! per job. On a tick all instances race for the job's lock; the winner
//! publishes one work message and the job itself runs in a queue consumer.

mod cron;
mod job;
mod job_scheduler;
mod trigger;

pub use cron::CronSchedule;
pub use job::{JobDescriptor, JobError, JobFailure};
pub use job_scheduler::{JobScheduler, TickFn};
pub use trigger::{ScheduledTrigger, TriggerOutcome};
