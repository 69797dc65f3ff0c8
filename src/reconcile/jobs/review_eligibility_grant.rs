use crate::booking_store::{to_unix, AppointmentStatus};
use crate::reconcile::{transition_due, DueBatch, Filter, ReconcileJob, Related};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Transaction;

/// Flags professionals as eligible for public reviews once they have
/// completed enough appointments. The flag is never cleared here.
pub struct ReviewEligibilityGrantJob {
    min_completed_appointments: i64,
}

impl ReviewEligibilityGrantJob {
    pub fn new(min_completed_appointments: i64) -> Self {
        Self {
            min_completed_appointments,
        }
    }
}

impl ReconcileJob for ReviewEligibilityGrantJob {
    fn id(&self) -> &'static str {
        "review_eligibility_grant"
    }

    fn name(&self) -> &'static str {
        "Review Eligibility Grant"
    }

    fn description(&self) -> &'static str {
        "Mark professionals with enough completed appointments as review eligible"
    }

    fn table(&self) -> &'static str {
        "professionals"
    }

    fn due_filter(&self, _now: DateTime<Utc>) -> Filter {
        Filter::all(vec![
            Filter::eq("review_eligible", false),
            Filter::count_at_least(
                Related::new(
                    "appointments",
                    "id",
                    "professional_id",
                    Filter::eq("status", AppointmentStatus::Completed.as_str()),
                ),
                self.min_completed_appointments,
            ),
        ])
    }

    fn apply(&self, tx: &Transaction, batch: &DueBatch) -> Result<usize> {
        let granted = transition_due(
            tx,
            self.table(),
            "review_eligible = ?, review_eligible_at = ?",
            vec![Value::Integer(1), Value::Integer(to_unix(&batch.now))],
            batch,
        )?;
        Ok(granted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Fixture, IntoSqlValue};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 20, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_threshold_and_flag() {
        let mut fixture = Fixture::new();
        for (id, eligible) in [(1i64, false), (2, false), (3, true)] {
            fixture.insert(
                "professionals",
                [("id", id.into_sql_value()), ("review_eligible", eligible.into_sql_value())],
            );
        }
        let appointments = [
            (1i64, "COMPLETED"),
            (1, "COMPLETED"),
            (1, "CANCELED"),
            (2, "COMPLETED"),
            (2, "CONFIRMED"),
            (3, "COMPLETED"),
            (3, "COMPLETED"),
        ];
        for (professional, status) in appointments {
            fixture.insert(
                "appointments",
                [
                    ("professional_id", professional.into_sql_value()),
                    ("status", status.into_sql_value()),
                ],
            );
        }

        let job = ReviewEligibilityGrantJob::new(2);
        assert_eq!(
            fixture.select_ids("professionals", &job.due_filter(now())),
            vec![1]
        );
        let lenient = ReviewEligibilityGrantJob::new(1);
        assert_eq!(
            fixture.select_ids("professionals", &lenient.due_filter(now())),
            vec![1, 2]
        );
    }
}
