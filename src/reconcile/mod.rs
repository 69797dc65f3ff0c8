//! Idempotent batch reconciliation.
//!
//! A job names a table, a due-predicate and the mutation applied to due rows.
//! [`BatchReconciler`] walks the due-set in keyset pages, one transaction per
//! page, re-checking the predicate inside the `UPDATE`. Rows a run has
//! transitioned no longer match, so re-running after a crash, a redelivery or
//! a duplicate trigger only touches what is still due.

mod batch;
mod context;
mod filter;
mod handler;
pub mod jobs;

pub use batch::{transition_due, BatchReconciler, DueBatch, ReconcileJob, ReconcileReport};
pub use context::JobContext;
pub use filter::{Filter, Fixture, IntoSqlValue, Record, Related};
pub use handler::ReconcileHandler;
