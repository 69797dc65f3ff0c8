//! Test fixtures for creating booking data and job contexts

use super::constants::*;
use booking_jobs::booking_store::{AppointmentStatus, NewAppointment, SqliteBookingStore};
use booking_jobs::clock::{Clock, ManualClock};
use booking_jobs::reconcile::JobContext;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fixed "now" every test starts from.
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(test_now()))
}

/// A booking database with one business offering one service, one
/// professional and one client.
pub struct BookingFixture {
    pub store: Arc<SqliteBookingStore>,
    pub clock: Arc<ManualClock>,
    pub business_id: i64,
    pub service_id: i64,
    pub professional_id: i64,
    pub person_id: i64,
}

impl BookingFixture {
    pub fn new() -> Self {
        let store = Arc::new(SqliteBookingStore::in_memory().unwrap());
        Self::with_store(store)
    }

    pub fn with_store(store: Arc<SqliteBookingStore>) -> Self {
        let clock = manual_clock();
        let business_id = store
            .insert_business("Studio Uno", true, test_now() - Duration::days(90))
            .unwrap();
        let service_id = store
            .insert_service(business_id, SERVICE_NAME, SERVICE_PRICE_CENTS)
            .unwrap();
        let professional_id = store.insert_professional(business_id, "Ada").unwrap();
        let person_id = store.insert_person("Grace").unwrap();
        Self {
            store,
            clock,
            business_id,
            service_id,
            professional_id,
            person_id,
        }
    }

    /// Insert a one-hour appointment that ended `minutes_ago` minutes
    /// before the fixture clock's current time (negative for the future).
    pub fn appointment(&self, status: AppointmentStatus, minutes_ago: i64) -> i64 {
        self.appointment_for(self.professional_id, status, minutes_ago)
    }

    pub fn appointment_for(
        &self,
        professional_id: i64,
        status: AppointmentStatus,
        minutes_ago: i64,
    ) -> i64 {
        let end = self.clock.now() - Duration::minutes(minutes_ago);
        self.store
            .insert_appointment(&NewAppointment {
                status,
                start_at_utc: end - Duration::hours(1),
                end_at_utc: end,
                professional_id,
                service_id: self.service_id,
                person_id: self.person_id,
            })
            .unwrap()
    }

    pub fn context(&self) -> JobContext {
        JobContext::new(
            CancellationToken::new(),
            self.store.clone(),
            self.clock.clone(),
        )
    }

    /// Run a scalar query against the booking database.
    pub fn count(&self, sql: &str) -> i64 {
        self.store
            .with_connection(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }
}
