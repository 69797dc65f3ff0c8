use crate::booking_store::SqliteBookingStore;
use crate::clock::Clock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to reconcile jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// The relational store holding the records being reconciled.
    pub store: Arc<SqliteBookingStore>,

    /// Source of "now" for due-predicates.
    pub clock: Arc<dyn Clock>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        store: Arc<SqliteBookingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cancellation_token,
            store,
            clock,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// The batch loop checks this between batches, so a cancelled run keeps
    /// every batch it already committed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
