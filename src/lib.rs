//! Booking Jobs Library
//!
//! Scheduled-job coordination for the booking platform: a lock-guarded cron
//! trigger per job, a single-in-flight queue consumer, and idempotent batch
//! reconcilers over the booking database.

pub mod booking_store;
pub mod clock;
pub mod config;
pub mod coordination_store;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use booking_store::SqliteBookingStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordination_store::{JobRunStore, SqliteCoordinationStore};
pub use lock::{DistributedLock, LockHandle, LockStore};
pub use queue::{JobConsumer, WorkQueue};
pub use runtime::JobRuntime;
pub use scheduler::{JobDescriptor, JobScheduler, ScheduledTrigger};
