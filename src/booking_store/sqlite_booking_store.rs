use super::models::*;
use super::schema::BOOKING_VERSIONED_SCHEMAS;
use crate::reconcile::Filter;
use crate::sqlite_persistence::initialize_schema;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

pub(crate) fn to_unix(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

/// Relational store the reconcilers run against.
///
/// The booking flow owns this data; the store exposes the keyset scan and
/// transaction primitives the jobs need, plus the writes and reads the
/// booking flow and tests use to set up and inspect state.
pub struct SqliteBookingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBookingStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open booking database {:?}", path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        initialize_schema(&mut conn, BOOKING_VERSIONED_SCHEMAS, "booking")?;
        info!("Opened booking database at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        initialize_schema(&mut conn, BOOKING_VERSIONED_SCHEMAS, "booking")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Booking database mutex poisoned"))
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    /// Run `f` in one transaction, committed iff it returns `Ok`.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// One keyset page of the ids in `table` matching `filter`, ascending,
    /// strictly after `after` when given.
    pub fn select_due_ids(
        &self,
        table: &str,
        filter: &Filter,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let (clause, mut values) = filter.to_sql("t");
        let mut sql = format!("SELECT t.id FROM {} AS t WHERE {}", table, clause);
        if let Some(cursor) = after {
            sql.push_str(" AND t.id > ?");
            values.push(Value::Integer(cursor));
        }
        sql.push_str(" ORDER BY t.id LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Writes owned by the booking flow
    // -------------------------------------------------------------------------

    pub fn insert_business(&self, name: &str, is_active: bool, created_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO businesses (name, is_active, created_at) VALUES (?1, ?2, ?3)",
            params![name, is_active, to_unix(&created_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_plan(&self, name: &str, billing_period: BillingPeriod) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plans (name, billing_period) VALUES (?1, ?2)",
            params![name, billing_period.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_subscription(
        &self,
        business_id: i64,
        plan_id: i64,
        status: SubscriptionStatus,
        current_period_end: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subscriptions (business_id, plan_id, status, current_period_end)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                business_id,
                plan_id,
                status.as_str(),
                to_unix(&current_period_end)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_service(&self, business_id: i64, name: &str, price_in_cents: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO services (business_id, name, price_in_cents) VALUES (?1, ?2, ?3)",
            params![business_id, name, price_in_cents],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_professional(&self, business_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO professionals (business_id, name) VALUES (?1, ?2)",
            params![business_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_person(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO persons (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_appointment(&self, appointment: &NewAppointment) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO appointments
                (status, start_at_utc, end_at_utc, professional_id, service_id, person_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                appointment.status.as_str(),
                to_unix(&appointment.start_at_utc),
                to_unix(&appointment.end_at_utc),
                appointment.professional_id,
                appointment.service_id,
                appointment.person_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get_appointment(&self, id: i64) -> Result<Option<Appointment>> {
        let conn = self.conn()?;
        let appointment = conn
            .query_row(
                "SELECT id, status, start_at_utc, end_at_utc, professional_id, service_id,
                        person_id, updated_at
                 FROM appointments WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(1)?;
                    let updated_at: Option<i64> = row.get(7)?;
                    Ok(Appointment {
                        id: row.get(0)?,
                        status: AppointmentStatus::parse(&status)
                            .unwrap_or(AppointmentStatus::Pending),
                        start_at_utc: from_unix(row.get(2)?),
                        end_at_utc: from_unix(row.get(3)?),
                        professional_id: row.get(4)?,
                        service_id: row.get(5)?,
                        person_id: row.get(6)?,
                        updated_at: updated_at.map(from_unix),
                    })
                },
            )
            .optional()?;
        Ok(appointment)
    }

    pub fn get_appointment_events(&self, appointment_id: i64) -> Result<Vec<AppointmentEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, appointment_id, event_type, by_professional, reason, created_at
             FROM appointment_events WHERE appointment_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![appointment_id], |row| {
                Ok(AppointmentEvent {
                    id: row.get(0)?,
                    appointment_id: row.get(1)?,
                    event_type: row.get(2)?,
                    by_professional: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: from_unix(row.get(5)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_ledger_entries(&self, appointment_id: i64) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, appointment_id, business_id, professional_id, type, value_in_cents, description
             FROM professional_statements WHERE appointment_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![appointment_id], |row| {
                let entry_type: String = row.get(4)?;
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    appointment_id: row.get(1)?,
                    business_id: row.get(2)?,
                    professional_id: row.get(3)?,
                    entry_type: StatementType::parse(&entry_type).unwrap_or(StatementType::Income),
                    value_in_cents: row.get(5)?,
                    description: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn get_business(&self, id: i64) -> Result<Option<Business>> {
        let conn = self.conn()?;
        let business = conn
            .query_row(
                "SELECT id, name, is_active, deactivated_at FROM businesses WHERE id = ?1",
                params![id],
                |row| {
                    let deactivated_at: Option<i64> = row.get(3)?;
                    Ok(Business {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        is_active: row.get(2)?,
                        deactivated_at: deactivated_at.map(from_unix),
                    })
                },
            )
            .optional()?;
        Ok(business)
    }

    pub fn get_business_events(&self, business_id: i64) -> Result<Vec<BusinessEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, business_id, event_type, reason, created_at
             FROM business_events WHERE business_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![business_id], |row| {
                Ok(BusinessEvent {
                    id: row.get(0)?,
                    business_id: row.get(1)?,
                    event_type: row.get(2)?,
                    reason: row.get(3)?,
                    created_at: from_unix(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_professional(&self, id: i64) -> Result<Option<Professional>> {
        let conn = self.conn()?;
        let professional = conn
            .query_row(
                "SELECT id, business_id, name, review_eligible, review_eligible_at
                 FROM professionals WHERE id = ?1",
                params![id],
                |row| {
                    let eligible_at: Option<i64> = row.get(4)?;
                    Ok(Professional {
                        id: row.get(0)?,
                        business_id: row.get(1)?,
                        name: row.get(2)?,
                        review_eligible: row.get(3)?,
                        review_eligible_at: eligible_at.map(from_unix),
                    })
                },
            )
            .optional()?;
        Ok(professional)
    }
}
