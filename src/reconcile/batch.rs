use super::context::JobContext;
use super::filter::Filter;
use crate::scheduler::{JobError, JobFailure};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction};
use tracing::{debug, info};

/// One keyset page of candidate ids, handed to [`ReconcileJob::apply`].
pub struct DueBatch<'a> {
    /// Ids selected as due, ascending. Some may have stopped being due since.
    pub ids: &'a [i64],
    /// The run's due-predicate, to be re-applied inside the mutation.
    pub filter: &'a Filter,
    /// The run's frozen "now".
    pub now: DateTime<Utc>,
}

/// A reconciler: which rows are due, and what happens to them.
///
/// Everything else (paging, transactions, cancellation) belongs to
/// [`BatchReconciler`].
pub trait ReconcileJob: Send + Sync {
    /// Unique identifier, also the job name in work messages.
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Table scanned for due rows. Must have an integer `id` primary key.
    fn table(&self) -> &'static str;

    fn due_filter(&self, now: DateTime<Utc>) -> Filter;

    /// Transition the still-due rows of `batch` and write their side
    /// effects, all through `tx`. Returns how many rows were transitioned.
    ///
    /// Returning an error rolls the whole batch back.
    fn apply(&self, tx: &Transaction, batch: &DueBatch) -> Result<usize>;
}

/// Update the rows of `batch` that still satisfy its due-predicate and return
/// their ids.
///
/// `set_clause` holds anonymous `?` placeholders bound from `set_params`.
/// Rows that left the due-set after the page was read are not touched, which
/// is what makes running a job twice for the same tick harmless.
pub fn transition_due(
    tx: &Transaction,
    table: &str,
    set_clause: &str,
    set_params: Vec<Value>,
    batch: &DueBatch,
) -> Result<Vec<i64>> {
    if batch.ids.is_empty() {
        return Ok(Vec::new());
    }
    let (due_clause, due_params) = batch.filter.to_sql("t");
    let placeholders = vec!["?"; batch.ids.len()].join(", ");
    let sql = format!(
        "UPDATE {table} AS t SET {set_clause} WHERE t.id IN ({placeholders}) AND {due_clause} RETURNING id"
    );

    let mut values = set_params;
    values.extend(batch.ids.iter().map(|id| Value::Integer(*id)));
    values.extend(due_params);

    let mut stmt = tx.prepare(&sql)?;
    let mut ids = stmt
        .query_map(params_from_iter(values), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    ids.sort_unstable();
    Ok(ids)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub batches: usize,
    /// Ids read from due pages.
    pub scanned: usize,
    pub transitioned: usize,
}

/// Keyset-paginated, one-transaction-per-batch driver shared by every job.
#[derive(Debug, Clone, Copy)]
pub struct BatchReconciler {
    batch_size: usize,
}

impl BatchReconciler {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Walk the due-set once from the start.
    ///
    /// `now` is read once so the cutoff does not drift between batches. A
    /// failing batch stops the run with everything before it committed; the
    /// returned [`JobFailure`] counts those records, and the next run picks
    /// up whatever is still due.
    pub fn run(&self, job: &dyn ReconcileJob, ctx: &JobContext) -> Result<ReconcileReport, JobFailure> {
        let mut report = ReconcileReport::default();
        match self.walk(job, ctx, &mut report) {
            Ok(()) => Ok(report),
            Err(error) => Err(JobFailure {
                error,
                transitioned: report.transitioned as u64,
            }),
        }
    }

    fn walk(
        &self,
        job: &dyn ReconcileJob,
        ctx: &JobContext,
        report: &mut ReconcileReport,
    ) -> Result<(), JobError> {
        let now = ctx.clock.now();
        let filter = job.due_filter(now);
        let mut cursor: Option<i64> = None;

        loop {
            if ctx.is_cancelled() {
                info!(
                    "{} cancelled after {} batches ({} transitioned)",
                    job.name(),
                    report.batches,
                    report.transitioned
                );
                return Err(JobError::Cancelled);
            }

            let page = ctx
                .store
                .select_due_ids(job.table(), &filter, cursor, self.batch_size)?;
            if page.is_empty() {
                break;
            }

            let batch = DueBatch {
                ids: &page,
                filter: &filter,
                now,
            };
            let transitioned = ctx
                .store
                .with_transaction(|tx| job.apply(tx, &batch))
                .with_context(|| {
                    format!(
                        "{} batch {} (ids {}..={}) rolled back",
                        job.id(),
                        report.batches + 1,
                        page[0],
                        page[page.len() - 1]
                    )
                })?;

            report.batches += 1;
            report.scanned += page.len();
            report.transitioned += transitioned;
            debug!(
                "{} batch {}: {} due, {} transitioned",
                job.id(),
                report.batches,
                page.len(),
                transitioned
            );

            cursor = page.last().copied();
            if page.len() < self.batch_size {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking_store::SqliteBookingStore;
    use crate::clock::{Clock, ManualClock};
    use chrono::TimeZone;
    use rusqlite::params;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Flips `tasks.state` from `due` to `done`; optionally fails any batch
    /// containing `fail_on`.
    struct TaskJob {
        fail_on: Option<i64>,
    }

    impl ReconcileJob for TaskJob {
        fn id(&self) -> &'static str {
            "task_job"
        }

        fn name(&self) -> &'static str {
            "Task Job"
        }

        fn description(&self) -> &'static str {
            "Completes due tasks"
        }

        fn table(&self) -> &'static str {
            "tasks"
        }

        fn due_filter(&self, _now: DateTime<Utc>) -> Filter {
            Filter::eq("state", "due")
        }

        fn apply(&self, tx: &Transaction, batch: &DueBatch) -> Result<usize> {
            let ids = transition_due(
                tx,
                "tasks",
                "state = ?, processed_count = processed_count + 1",
                vec![Value::Text("done".into())],
                batch,
            )?;
            if let Some(fail_on) = self.fail_on {
                if batch.ids.contains(&fail_on) {
                    anyhow::bail!("side effect for task {} failed", fail_on);
                }
            }
            Ok(ids.len())
        }
    }

    fn context(due: usize, not_due: usize) -> JobContext {
        let store = Arc::new(SqliteBookingStore::in_memory().unwrap());
        store
            .with_connection(|conn| {
                conn.execute(
                    "CREATE TABLE tasks (id INTEGER PRIMARY KEY, state TEXT NOT NULL,
                                         processed_count INTEGER NOT NULL DEFAULT 0)",
                    [],
                )?;
                for i in 0..(due + not_due) {
                    let state = if i % 2 == 0 && i / 2 < not_due { "idle" } else { "due" };
                    conn.execute("INSERT INTO tasks (state) VALUES (?1)", params![state])?;
                }
                Ok(())
            })
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        JobContext::new(CancellationToken::new(), store, clock)
    }

    fn count(ctx: &JobContext, sql: &str) -> i64 {
        ctx.store
            .with_connection(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_walks_every_page_once() {
        let ctx = context(7, 4);
        let report = BatchReconciler::new(3)
            .run(&TaskJob { fail_on: None }, &ctx)
            .unwrap();

        assert_eq!(report.transitioned, 7);
        assert_eq!(report.scanned, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(count(&ctx, "SELECT COUNT(*) FROM tasks WHERE state = 'done'"), 7);
        assert_eq!(count(&ctx, "SELECT COUNT(*) FROM tasks WHERE state = 'idle'"), 4);
        assert_eq!(count(&ctx, "SELECT MAX(processed_count) FROM tasks"), 1);
    }

    #[test]
    fn test_second_run_finds_nothing() {
        let ctx = context(5, 0);
        let reconciler = BatchReconciler::new(2);
        let job = TaskJob { fail_on: None };

        assert_eq!(reconciler.run(&job, &ctx).unwrap().transitioned, 5);
        let again = reconciler.run(&job, &ctx).unwrap();
        assert_eq!(again, ReconcileReport::default());
    }

    #[test]
    fn test_exact_multiple_of_batch_size_stops_on_empty_page() {
        let ctx = context(4, 0);
        let report = BatchReconciler::new(2)
            .run(&TaskJob { fail_on: None }, &ctx)
            .unwrap();

        assert_eq!(report.transitioned, 4);
        assert_eq!(report.batches, 2);
    }

    #[test]
    fn test_update_rechecks_predicate() {
        let ctx = context(3, 0);
        let filter = Filter::eq("state", "due");
        let page = ctx.store.select_due_ids("tasks", &filter, None, 10).unwrap();
        assert_eq!(page, vec![1, 2, 3]);

        // another writer moves task 2 out of the due-set after the read
        ctx.store
            .with_connection(|conn| {
                conn.execute("UPDATE tasks SET state = 'canceled' WHERE id = 2", [])?;
                Ok(())
            })
            .unwrap();

        let batch = DueBatch {
            ids: &page,
            filter: &filter,
            now: ctx.clock.now(),
        };
        let transitioned = ctx
            .store
            .with_transaction(|tx| {
                transition_due(tx, "tasks", "state = ?", vec![Value::Text("done".into())], &batch)
            })
            .unwrap();

        assert_eq!(transitioned, vec![1, 3]);
        assert_eq!(
            count(&ctx, "SELECT COUNT(*) FROM tasks WHERE state = 'canceled'"),
            1
        );
    }

    #[test]
    fn test_failed_batch_rolls_back_and_keeps_earlier_batches() {
        let ctx = context(6, 0);
        let failure = BatchReconciler::new(2)
            .run(&TaskJob { fail_on: Some(4) }, &ctx)
            .unwrap_err();

        assert!(matches!(failure.error, JobError::ExecutionFailed(_)));
        assert!(failure.to_string().contains("side effect for task 4 failed"));
        // batch [1, 2] committed, batch [3, 4] rolled back, [5, 6] never reached
        assert_eq!(failure.transitioned, 2);
        assert_eq!(count(&ctx, "SELECT COUNT(*) FROM tasks WHERE state = 'done'"), 2);

        // the next run retries the remainder from scratch
        let report = BatchReconciler::new(2)
            .run(&TaskJob { fail_on: None }, &ctx)
            .unwrap();
        assert_eq!(report.transitioned, 4);
    }

    #[test]
    fn test_cancelled_before_start_changes_nothing() {
        let ctx = context(3, 0);
        ctx.cancellation_token.cancel();

        let failure = BatchReconciler::new(2)
            .run(&TaskJob { fail_on: None }, &ctx)
            .unwrap_err();

        assert!(matches!(failure.error, JobError::Cancelled));
        assert_eq!(failure.transitioned, 0);
        assert_eq!(count(&ctx, "SELECT COUNT(*) FROM tasks WHERE state = 'done'"), 0);
    }
}
