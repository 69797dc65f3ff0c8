//! Closes appointments whose end time has passed.
//!
//! Each completed appointment gets a `COMPLETED_AUTO` audit event and an
//! INCOME ledger entry for the service price, in the same transaction as the
//! status change.

use crate::booking_store::{to_unix, AppointmentStatus, StatementType, EVENT_COMPLETED_AUTO};
use crate::reconcile::{transition_due, DueBatch, Filter, ReconcileJob, Related};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Transaction};

pub const AUTO_COMPLETION_REASON: &str = "Automatically completed after end time";

pub struct AppointmentAutoCompletionJob {
    grace: Duration,
}

impl AppointmentAutoCompletionJob {
    /// `grace` is how long after its end an appointment is left alone, to
    /// absorb clock skew and queue latency.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl ReconcileJob for AppointmentAutoCompletionJob {
    fn id(&self) -> &'static str {
        "appointment_auto_completion"
    }

    fn name(&self) -> &'static str {
        "Appointment Auto Completion"
    }

    fn description(&self) -> &'static str {
        "Complete pending and confirmed appointments past their end time and book their income"
    }

    fn table(&self) -> &'static str {
        "appointments"
    }

    fn due_filter(&self, now: DateTime<Utc>) -> Filter {
        Filter::all(vec![
            Filter::in_list(
                "status",
                [
                    AppointmentStatus::Pending.as_str(),
                    AppointmentStatus::Confirmed.as_str(),
                ],
            ),
            Filter::lt("end_at_utc", to_unix(&(now - self.grace))),
            // without its service there is no price to book
            Filter::exists(Related::new("services", "service_id", "id", Filter::all(vec![]))),
        ])
    }

    fn apply(&self, tx: &Transaction, batch: &DueBatch) -> Result<usize> {
        let now = to_unix(&batch.now);
        let completed = transition_due(
            tx,
            self.table(),
            "status = ?, updated_at = ?",
            vec![
                Value::Text(AppointmentStatus::Completed.as_str().to_string()),
                Value::Integer(now),
            ],
            batch,
        )?;

        let mut insert_event = tx.prepare(
            "INSERT INTO appointment_events
                (appointment_id, event_type, by_professional, reason, created_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
        )?;
        let mut insert_income = tx.prepare(
            "INSERT INTO professional_statements
                (appointment_id, business_id, professional_id, type, value_in_cents,
                 description, created_at)
             SELECT a.id, s.business_id, a.professional_id, ?2, s.price_in_cents,
                    'Appointment #' || a.id || ' - ' || s.name, ?3
             FROM appointments a JOIN services s ON s.id = a.service_id
             WHERE a.id = ?1",
        )?;

        for appointment_id in &completed {
            insert_event.execute(params![
                appointment_id,
                EVENT_COMPLETED_AUTO,
                AUTO_COMPLETION_REASON,
                now
            ])?;
            let booked = insert_income.execute(params![
                appointment_id,
                StatementType::Income.as_str(),
                now
            ])?;
            if booked != 1 {
                bail!("No ledger entry could be booked for appointment {}", appointment_id);
            }
        }

        Ok(completed.len())
    }
}
