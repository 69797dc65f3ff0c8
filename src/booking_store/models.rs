use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Canceled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Canceled => "CANCELED",
            AppointmentStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AppointmentStatus::Pending),
            "CONFIRMED" => Some(AppointmentStatus::Confirmed),
            "CANCELED" => Some(AppointmentStatus::Canceled),
            "COMPLETED" => Some(AppointmentStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingPeriod {
    Monthly,
    Yearly,
    Trial,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "MONTHLY",
            BillingPeriod::Yearly => "YEARLY",
            BillingPeriod::Trial => "TRIAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
            SubscriptionStatus::Unpaid => "UNPAID",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }

    /// Statuses under which a subscription still grants access until its
    /// period ends.
    pub const STILL_VALID: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::PastDue,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Income,
    Outcome,
}

impl StatementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementType::Income => "INCOME",
            StatementType::Outcome => "OUTCOME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCOME" => Some(StatementType::Income),
            "OUTCOME" => Some(StatementType::Outcome),
            _ => None,
        }
    }
}

pub const EVENT_COMPLETED_AUTO: &str = "COMPLETED_AUTO";
pub const EVENT_TRIAL_EXPIRED_DEACTIVATED: &str = "TRIAL_EXPIRED_DEACTIVATED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: i64,
    pub status: AppointmentStatus,
    pub start_at_utc: DateTime<Utc>,
    pub end_at_utc: DateTime<Utc>,
    pub professional_id: i64,
    pub service_id: i64,
    pub person_id: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input of the external booking flow.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub status: AppointmentStatus,
    pub start_at_utc: DateTime<Utc>,
    pub end_at_utc: DateTime<Utc>,
    pub professional_id: i64,
    pub service_id: i64,
    pub person_id: i64,
}

/// Append-only audit row, one per status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentEvent {
    pub id: i64,
    pub appointment_id: i64,
    pub event_type: String,
    pub by_professional: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A professional's ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: i64,
    pub appointment_id: i64,
    pub business_id: i64,
    pub professional_id: i64,
    pub entry_type: StatementType,
    pub value_in_cents: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Business {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessEvent {
    pub id: i64,
    pub business_id: i64,
    pub event_type: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Professional {
    pub id: i64,
    pub business_id: i64,
    pub name: String,
    pub review_eligible: bool,
    pub review_eligible_at: Option<DateTime<Utc>>,
}
