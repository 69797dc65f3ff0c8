use super::models::{JobRun, JobRunStatus};
use super::schema::COORDINATION_VERSIONED_SCHEMAS;
use super::JobRunStore;
use crate::clock::Clock;
use crate::lock::LockStore;
use crate::queue::{DeadLetter, Delivery, WorkQueue};
use crate::sqlite_persistence::initialize_schema;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Lock store, work queue and run log in one SQLite file.
///
/// Every instance opens the same file. Lock primitives are single statements
/// and queue claims run in `BEGIN IMMEDIATE` transactions, so SQLite's write
/// lock serialises them across processes.
pub struct SqliteCoordinationStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    instance_id: String,
}

impl SqliteCoordinationStore {
    pub fn new<P: AsRef<Path>>(db_path: P, clock: Arc<dyn Clock>, instance_id: &str) -> Result<Self> {
        let path = db_path.as_ref();
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open coordination database {:?}", path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        info!(
            "Opened coordination database at {:?} (journal mode {})",
            path, journal_mode
        );
        initialize_schema(&mut conn, COORDINATION_VERSIONED_SCHEMAS, "coordination")?;
        Ok(Self::from_connection(conn, clock, instance_id))
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        initialize_schema(&mut conn, COORDINATION_VERSIONED_SCHEMAS, "coordination")?;
        Ok(Self::from_connection(conn, clock, "in-memory"))
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>, instance_id: &str) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            instance_id: instance_id.to_string(),
        }
    }

    /// How long a received message stays invisible before redelivery.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Coordination database mutex poisoned"))
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn ms_after(&self, duration: Duration) -> i64 {
        self.now_ms().saturating_add(duration.as_millis() as i64)
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339()
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_job_run(row: &rusqlite::Row) -> rusqlite::Result<JobRun> {
        let status_str: String = row.get("status")?;
        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: Option<String> = row.get("finished_at")?;
        let transitioned: i64 = row.get("transitioned")?;

        Ok(JobRun {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            started_at: Self::parse_datetime(&started_at_str).unwrap_or_default(),
            finished_at: finished_at_str.as_deref().and_then(Self::parse_datetime),
            status: JobRunStatus::parse(&status_str).unwrap_or(JobRunStatus::Failed),
            transitioned: transitioned.max(0) as u64,
            error_message: row.get("error_message")?,
            triggered_by: row.get("triggered_by")?,
        })
    }
}

impl LockStore for SqliteCoordinationStore {
    fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO locks (key, token, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE
                SET token = excluded.token, expires_at_ms = excluded.expires_at_ms
                WHERE locks.expires_at_ms <= ?4",
            params![key, token, self.ms_after(ttl), self.now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn compare_and_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?3
             WHERE key = ?1 AND token = ?2 AND expires_at_ms > ?4",
            params![key, token, self.ms_after(ttl), self.now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND token = ?2 AND expires_at_ms > ?3",
            params![key, token, self.now_ms()],
        )?;
        Ok(changed == 1)
    }
}

impl WorkQueue for SqliteCoordinationStore {
    fn publish(&self, routing_key: &str, payload: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO work_queue (routing_key, payload, published_at_ms) VALUES (?1, ?2, ?3)",
            params![routing_key, payload, self.now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn receive(&self, routing_key: &str) -> Result<Option<Delivery>> {
        let now = self.now_ms();
        let deadline = self.ms_after(self.visibility_timeout);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let busy: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM work_queue
                           WHERE routing_key = ?1 AND in_flight_until_ms > ?2)",
            params![routing_key, now],
            |row| row.get(0),
        )?;
        if busy {
            tx.commit()?;
            return Ok(None);
        }

        let delivery = tx
            .query_row(
                "UPDATE work_queue
                 SET delivery_count = delivery_count + 1, in_flight_until_ms = ?2
                 WHERE id = (SELECT id FROM work_queue WHERE routing_key = ?1 ORDER BY id LIMIT 1)
                 RETURNING id, routing_key, payload, delivery_count",
                params![routing_key, deadline],
                |row| {
                    Ok(Delivery {
                        id: row.get(0)?,
                        routing_key: row.get(1)?,
                        payload: row.get(2)?,
                        delivery_count: row.get(3)?,
                    })
                },
            )
            .optional()?;
        tx.commit()?;
        Ok(delivery)
    }

    fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM work_queue
             WHERE id = ?1 AND delivery_count = ?2 AND in_flight_until_ms IS NOT NULL",
            params![delivery.id, delivery.delivery_count],
        )?;
        Ok(changed == 1)
    }

    fn requeue(&self, delivery: &Delivery) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE work_queue SET in_flight_until_ms = NULL
             WHERE id = ?1 AND delivery_count = ?2 AND in_flight_until_ms IS NOT NULL",
            params![delivery.id, delivery.delivery_count],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, delivery: &Delivery) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE work_queue
             SET in_flight_until_ms = NULL, delivery_count = MAX(delivery_count - 1, 0)
             WHERE id = ?1 AND delivery_count = ?2 AND in_flight_until_ms IS NOT NULL",
            params![delivery.id, delivery.delivery_count],
        )?;
        Ok(changed == 1)
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool> {
        let now = self.now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "INSERT INTO dead_letters
                (message_id, routing_key, payload, delivery_count, reason, dead_lettered_at_ms)
             SELECT id, routing_key, payload, delivery_count, ?3, ?4 FROM work_queue
             WHERE id = ?1 AND delivery_count = ?2 AND in_flight_until_ms IS NOT NULL",
            params![delivery.id, delivery.delivery_count, reason, now],
        )?;
        if moved == 1 {
            tx.execute("DELETE FROM work_queue WHERE id = ?1", params![delivery.id])?;
        }
        tx.commit()?;
        Ok(moved == 1)
    }

    fn dead_letters(&self, routing_key: &str) -> Result<Vec<DeadLetter>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, routing_key, payload, delivery_count, reason, dead_lettered_at_ms
             FROM dead_letters WHERE routing_key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![routing_key], |row| {
            let at_ms: i64 = row.get(6)?;
            Ok(DeadLetter {
                id: row.get(0)?,
                message_id: row.get(1)?,
                routing_key: row.get(2)?,
                payload: row.get(3)?,
                delivery_count: row.get(4)?,
                reason: row.get(5)?,
                dead_lettered_at: Utc
                    .timestamp_millis_opt(at_ms)
                    .single()
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn pending_count(&self, routing_key: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM work_queue WHERE routing_key = ?1",
            params![routing_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl JobRunStore for SqliteCoordinationStore {
    fn record_run_start(&self, job_id: &str, triggered_by: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_runs (job_id, started_at, status, triggered_by, executed_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                Self::format_datetime(&self.clock.now()),
                JobRunStatus::Running.as_str(),
                triggered_by,
                self.instance_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_run_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        transitioned: u64,
        error_message: Option<String>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE job_runs SET finished_at = ?1, status = ?2, transitioned = ?3, error_message = ?4
             WHERE id = ?5",
            params![
                Self::format_datetime(&self.clock.now()),
                status.as_str(),
                transitioned as i64,
                error_message,
                run_id
            ],
        )?;
        Ok(())
    }

    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, started_at, finished_at, status, transitioned, error_message, triggered_by
             FROM job_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![job_id, limit as i64], Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn mark_stale_runs_failed(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE job_runs SET status = ?1, finished_at = ?2, error_message = ?3
             WHERE status = ?4 AND executed_by = ?5",
            params![
                JobRunStatus::Failed.as_str(),
                Self::format_datetime(&self.clock.now()),
                "Instance restarted while the run was in progress",
                JobRunStatus::Running.as_str(),
                self.instance_id
            ],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sqlite_persistence::BASE_DB_VERSION;
    use tempfile::TempDir;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_lock_primitives() {
        let clock = clock();
        let store = SqliteCoordinationStore::in_memory(clock.clone()).unwrap();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).unwrap());
        assert!(!store.compare_and_extend("k", "b", ttl).unwrap());
        assert!(!store.compare_and_delete("k", "b").unwrap());
        assert!(store.compare_and_extend("k", "a", ttl).unwrap());

        clock.advance(chrono::Duration::seconds(10));
        assert!(!store.compare_and_delete("k", "a").unwrap());
        assert!(store.set_if_absent("k", "b", ttl).unwrap());
        assert!(store.compare_and_delete("k", "b").unwrap());
        assert!(store.set_if_absent("k", "c", ttl).unwrap());
    }

    #[test]
    fn test_queue_single_in_flight_and_redelivery() {
        let clock = clock();
        let store = SqliteCoordinationStore::in_memory(clock.clone())
            .unwrap()
            .with_visibility_timeout(Duration::from_secs(30));
        store.publish("jobs.a", "first").unwrap();
        store.publish("jobs.a", "second").unwrap();

        let first = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(first.payload, "first");
        assert!(store.receive("jobs.a").unwrap().is_none());

        clock.advance(chrono::Duration::seconds(31));
        let again = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
        assert!(!store.ack(&first).unwrap());
        assert!(store.ack(&again).unwrap());

        let second = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.payload, "second");
        assert!(store.dead_letter(&second, "poison").unwrap());
        assert!(!store.dead_letter(&second, "poison").unwrap());
        assert_eq!(store.pending_count("jobs.a").unwrap(), 0);

        let dead = store.dead_letters("jobs.a").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "second");
        assert_eq!(dead[0].reason, "poison");
        assert_eq!(dead[0].dead_lettered_at, clock.now());
    }

    #[test]
    fn test_requeue_makes_message_receivable() {
        let store = SqliteCoordinationStore::in_memory(clock()).unwrap();
        store.publish("jobs.a", "work").unwrap();

        let first = store.receive("jobs.a").unwrap().unwrap();
        assert!(store.requeue(&first).unwrap());
        let second = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
    }

    #[test]
    fn test_release_does_not_count_the_delivery() {
        let store = SqliteCoordinationStore::in_memory(clock()).unwrap();
        store.publish("jobs.a", "work").unwrap();

        let first = store.receive("jobs.a").unwrap().unwrap();
        assert!(store.release(&first).unwrap());
        let second = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(second.delivery_count, 1);

        assert!(store.requeue(&second).unwrap());
        let third = store.receive("jobs.a").unwrap().unwrap();
        assert_eq!(third.delivery_count, 2);
        // a stale claim cannot release the current one
        assert!(!store.release(&second).unwrap());
        assert!(store.release(&third).unwrap());
    }

    #[test]
    fn test_job_runs_and_stale_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("coordination.db");
        let clock = clock();

        {
            let store = SqliteCoordinationStore::new(&db_path, clock.clone(), "node-a").unwrap();
            let done = store.record_run_start("job", "schedule:node-b").unwrap();
            store
                .record_run_finish(done, JobRunStatus::Completed, 12, None)
                .unwrap();
            store.record_run_start("job", "schedule:node-b").unwrap();
        }

        let other = SqliteCoordinationStore::new(&db_path, clock.clone(), "node-c").unwrap();
        assert_eq!(other.mark_stale_runs_failed().unwrap(), 0);

        let reopened = SqliteCoordinationStore::new(&db_path, clock, "node-a").unwrap();
        assert_eq!(reopened.mark_stale_runs_failed().unwrap(), 1);

        let history = reopened.get_job_history("job", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, JobRunStatus::Failed);
        assert!(history[0].error_message.is_some());
        assert_eq!(history[1].status, JobRunStatus::Completed);
        assert_eq!(history[1].transitioned, 12);
        assert!(history[1].finished_at.is_some());
    }

    #[test]
    fn test_version_one_database_is_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("coordination.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            COORDINATION_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
            conn.execute(
                "INSERT INTO job_runs (job_id, started_at, status, triggered_by)
                 VALUES ('job', '2024-01-01T00:00:00+00:00', 'completed', 'schedule:x')",
                [],
            )
            .unwrap();
        }

        let store = SqliteCoordinationStore::new(&db_path, clock(), "node-a").unwrap();
        let version: i64 = store
            .conn()
            .unwrap()
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, (BASE_DB_VERSION + 2) as i64);

        let history = store.get_job_history("job", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transitioned, 0);
        store.publish("jobs.a", "x").unwrap();
        let delivery = store.receive("jobs.a").unwrap().unwrap();
        assert!(store.dead_letter(&delivery, "r").unwrap());
    }
}
