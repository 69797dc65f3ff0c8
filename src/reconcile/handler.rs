use super::batch::{BatchReconciler, ReconcileJob};
use super::context::JobContext;
use crate::booking_store::SqliteBookingStore;
use crate::clock::Clock;
use crate::metrics;
use crate::queue::{JobHandler, WorkMessage};
use crate::scheduler::JobFailure;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs a [`ReconcileJob`] for every work message its consumer receives.
pub struct ReconcileHandler {
    job: Arc<dyn ReconcileJob>,
    reconciler: BatchReconciler,
    store: Arc<SqliteBookingStore>,
    clock: Arc<dyn Clock>,
}

impl ReconcileHandler {
    pub fn new(
        job: Arc<dyn ReconcileJob>,
        reconciler: BatchReconciler,
        store: Arc<SqliteBookingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job,
            reconciler,
            store,
            clock,
        }
    }
}

impl JobHandler for ReconcileHandler {
    fn job_id(&self) -> &str {
        self.job.id()
    }

    fn handle(
        &self,
        message: &WorkMessage,
        cancellation: &CancellationToken,
    ) -> Result<u64, JobFailure> {
        let ctx = JobContext::new(cancellation.clone(), self.store.clone(), self.clock.clone());
        let report = match self.reconciler.run(self.job.as_ref(), &ctx) {
            Ok(report) => report,
            Err(failure) => {
                metrics::record_reconciled(self.job.id(), failure.transitioned);
                warn!(
                    "{}: stopped after {} records transitioned: {}",
                    self.job.name(),
                    failure.transitioned,
                    failure
                );
                return Err(failure);
            }
        };
        metrics::record_reconciled(self.job.id(), report.transitioned as u64);
        info!(
            "{}: {} records transitioned in {} batches (tick {} from {})",
            self.job.name(),
            report.transitioned,
            report.batches,
            message.triggered_at,
            message.triggered_by
        );
        Ok(report.transitioned as u64)
    }
}
