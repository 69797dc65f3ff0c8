mod models;
mod schema;
mod sqlite_coordination_store;

pub use models::*;
pub use schema::COORDINATION_VERSIONED_SCHEMAS;
pub use sqlite_coordination_store::SqliteCoordinationStore;

use anyhow::Result;

/// Log of consumed job runs.
pub trait JobRunStore: Send + Sync {
    fn record_run_start(&self, job_id: &str, triggered_by: &str) -> Result<i64>;
    fn record_run_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        transitioned: u64,
        error_message: Option<String>,
    ) -> Result<()>;
    /// Most recent runs first.
    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;
    /// Fail runs this instance left `running` before a restart.
    fn mark_stale_runs_failed(&self) -> Result<usize>;
}
