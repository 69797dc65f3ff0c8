//! Deactivates businesses whose free trial ran out without a paid plan.

use crate::booking_store::{
    to_unix, BillingPeriod, SubscriptionStatus, EVENT_TRIAL_EXPIRED_DEACTIVATED,
};
use crate::reconcile::{transition_due, DueBatch, Filter, ReconcileJob, Related};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Transaction};

pub const TRIAL_EXPIRED_REASON: &str = "Trial period ended without a valid subscription";

pub struct TrialExpiryDeactivationJob;

fn subscriptions(filter: Filter) -> Related {
    Related::new("subscriptions", "id", "business_id", filter)
}

fn plan(filter: Filter) -> Filter {
    Filter::exists(Related::new("plans", "plan_id", "id", filter))
}

impl ReconcileJob for TrialExpiryDeactivationJob {
    fn id(&self) -> &'static str {
        "trial_expiry_deactivation"
    }

    fn name(&self) -> &'static str {
        "Trial Expiry Deactivation"
    }

    fn description(&self) -> &'static str {
        "Deactivate businesses whose trial expired and that hold no other subscription"
    }

    fn table(&self) -> &'static str {
        "businesses"
    }

    /// Active businesses that
    /// 1. have an expired trial subscription,
    /// 2. never subscribed to a non-trial plan, and
    /// 3. hold no subscription that is still valid.
    fn due_filter(&self, now: DateTime<Utc>) -> Filter {
        let trial = Filter::eq("billing_period", BillingPeriod::Trial.as_str());
        let now = to_unix(&now);
        Filter::all(vec![
            Filter::eq("is_active", true),
            Filter::exists(subscriptions(Filter::all(vec![
                plan(trial.clone()),
                Filter::lt("current_period_end", now),
            ]))),
            Filter::not(Filter::exists(subscriptions(plan(Filter::not(trial))))),
            Filter::not(Filter::exists(subscriptions(Filter::all(vec![
                Filter::in_list(
                    "status",
                    SubscriptionStatus::STILL_VALID.iter().map(|s| s.as_str()),
                ),
                Filter::gt("current_period_end", now),
            ])))),
        ])
    }

    fn apply(&self, tx: &Transaction, batch: &DueBatch) -> Result<usize> {
        let now = to_unix(&batch.now);
        let deactivated = transition_due(
            tx,
            self.table(),
            "is_active = ?, deactivated_at = ?",
            vec![Value::Integer(0), Value::Integer(now)],
            batch,
        )?;

        let mut insert_event = tx.prepare(
            "INSERT INTO business_events (business_id, event_type, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for business_id in &deactivated {
            insert_event.execute(params![
                business_id,
                EVENT_TRIAL_EXPIRED_DEACTIVATED,
                TRIAL_EXPIRED_REASON,
                now
            ])?;
        }
        Ok(deactivated.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Fixture, IntoSqlValue};
    use chrono::{Duration, TimeZone};

    const TRIAL_PLAN: i64 = 1;
    const MONTHLY_PLAN: i64 = 2;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, 0, 0, 0).unwrap()
    }

    fn days(d: i64) -> Value {
        to_unix(&(now() + Duration::days(d))).into_sql_value()
    }

    fn base_fixture() -> Fixture {
        let mut fixture = Fixture::new();
        fixture
            .insert(
                "plans",
                [("id", TRIAL_PLAN.into_sql_value()), ("billing_period", "TRIAL".into_sql_value())],
            )
            .insert(
                "plans",
                [("id", MONTHLY_PLAN.into_sql_value()), ("billing_period", "MONTHLY".into_sql_value())],
            );
        fixture
    }

    fn business(fixture: &mut Fixture, id: i64, active: bool) {
        fixture.insert(
            "businesses",
            [("id", id.into_sql_value()), ("is_active", active.into_sql_value())],
        );
    }

    fn subscription(fixture: &mut Fixture, business: i64, plan: i64, status: &str, end: Value) {
        fixture.insert(
            "subscriptions",
            [
                ("business_id", business.into_sql_value()),
                ("plan_id", plan.into_sql_value()),
                ("status", status.into_sql_value()),
                ("current_period_end", end),
            ],
        );
    }

    fn due(fixture: &Fixture) -> Vec<i64> {
        fixture.select_ids("businesses", &TrialExpiryDeactivationJob.due_filter(now()))
    }

    #[test]
    fn test_expired_trial_only_is_due() {
        let mut fixture = base_fixture();
        business(&mut fixture, 1, true);
        subscription(&mut fixture, 1, TRIAL_PLAN, "EXPIRED", days(-1));

        assert_eq!(due(&fixture), vec![1]);
    }

    #[test]
    fn test_trial_still_running_is_not_due() {
        let mut fixture = base_fixture();
        business(&mut fixture, 1, true);
        subscription(&mut fixture, 1, TRIAL_PLAN, "TRIALING", days(3));

        assert!(due(&fixture).is_empty());
    }

    #[test]
    fn test_paid_history_blocks_deactivation() {
        let mut fixture = base_fixture();
        business(&mut fixture, 1, true);
        subscription(&mut fixture, 1, TRIAL_PLAN, "EXPIRED", days(-30));
        // upgraded once, long since canceled
        subscription(&mut fixture, 1, MONTHLY_PLAN, "CANCELED", days(-5));

        assert!(due(&fixture).is_empty());
    }

    #[test]
    fn test_currently_valid_subscription_blocks_deactivation() {
        let mut fixture = base_fixture();
        business(&mut fixture, 1, true);
        subscription(&mut fixture, 1, TRIAL_PLAN, "EXPIRED", days(-10));
        // a second trial granted by support, still valid
        subscription(&mut fixture, 1, TRIAL_PLAN, "PAST_DUE", days(2));

        assert!(due(&fixture).is_empty());
    }

    #[test]
    fn test_inactive_or_unsubscribed_businesses_are_ignored() {
        let mut fixture = base_fixture();
        business(&mut fixture, 1, false);
        subscription(&mut fixture, 1, TRIAL_PLAN, "EXPIRED", days(-1));
        business(&mut fixture, 2, true);

        assert!(due(&fixture).is_empty());
    }
}
