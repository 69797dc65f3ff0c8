//! Relational schema of the booking database, restricted to what the
//! scheduled jobs read and write. Timestamps are unix seconds.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema};

const BUSINESSES_TABLE: Table = Table {
    name: "businesses",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "is_active",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("deactivated_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const BUSINESS_EVENTS_TABLE: Table = Table {
    name: "business_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "business_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "businesses",
                foreign_column: "id",
            })
        ),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("reason", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_business_events_business", "business_id")],
    unique_constraints: &[],
};

const PLANS_TABLE: Table = Table {
    name: "plans",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("billing_period", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const SUBSCRIPTIONS_TABLE: Table = Table {
    name: "subscriptions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "business_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "businesses",
                foreign_column: "id",
            })
        ),
        sqlite_column!(
            "plan_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "plans",
                foreign_column: "id",
            })
        ),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("current_period_end", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_subscriptions_business", "business_id")],
    unique_constraints: &[],
};

const SERVICES_TABLE: Table = Table {
    name: "services",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "business_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "businesses",
                foreign_column: "id",
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("price_in_cents", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const PROFESSIONALS_TABLE: Table = Table {
    name: "professionals",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "business_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "businesses",
                foreign_column: "id",
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "review_eligible",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("review_eligible_at", &SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[],
};

const PERSONS_TABLE: Table = Table {
    name: "persons",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// `service_id` carries no foreign key: rows written by older booking flows
/// may reference deleted services and must stay readable.
const APPOINTMENTS_TABLE: Table = Table {
    name: "appointments",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("start_at_utc", &SqlType::Integer, non_null = true),
        sqlite_column!("end_at_utc", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "professional_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "professionals",
                foreign_column: "id",
            })
        ),
        sqlite_column!("service_id", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "person_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "persons",
                foreign_column: "id",
            })
        ),
        sqlite_column!("updated_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_appointments_status_end", "status, end_at_utc"),
        ("idx_appointments_professional", "professional_id"),
    ],
    unique_constraints: &[],
};

const APPOINTMENT_EVENTS_TABLE: Table = Table {
    name: "appointment_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "appointment_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "appointments",
                foreign_column: "id",
            })
        ),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!(
            "by_professional",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("reason", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_appointment_events_appointment", "appointment_id")],
    unique_constraints: &[],
};

const PROFESSIONAL_STATEMENTS_TABLE: Table = Table {
    name: "professional_statements",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "appointment_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "appointments",
                foreign_column: "id",
            })
        ),
        sqlite_column!("business_id", &SqlType::Integer, non_null = true),
        sqlite_column!("professional_id", &SqlType::Integer, non_null = true),
        sqlite_column!("type", &SqlType::Text, non_null = true),
        sqlite_column!("value_in_cents", &SqlType::Integer, non_null = true),
        sqlite_column!("description", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    // one ledger row per appointment and direction
    unique_constraints: &[&["appointment_id", "type"]],
};

pub static BOOKING_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        BUSINESSES_TABLE,
        BUSINESS_EVENTS_TABLE,
        PLANS_TABLE,
        SUBSCRIPTIONS_TABLE,
        SERVICES_TABLE,
        PROFESSIONALS_TABLE,
        PERSONS_TABLE,
        APPOINTMENTS_TABLE,
        APPOINTMENT_EVENTS_TABLE,
        PROFESSIONAL_STATEMENTS_TABLE,
    ],
    migration: None,
}];
