//! Schema of the coordination database shared by every instance on a host.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// Trigger locks, one row per held key. Expired rows are overwritten in place.
const LOCKS_TABLE_V1: Table = Table {
    name: "locks",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("token", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at_ms", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const WORK_QUEUE_TABLE_V1: Table = Table {
    name: "work_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("routing_key", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("published_at_ms", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "delivery_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        // NULL when not claimed
        sqlite_column!("in_flight_until_ms", &SqlType::Integer),
    ],
    indices: &[("idx_work_queue_routing_key", "routing_key, id")],
    unique_constraints: &[],
};

const JOB_RUNS_TABLE_V1: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_runs_job_id", "job_id, id DESC"),
        ("idx_job_runs_status", "status"),
    ],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - dead letters, run bookkeeping per consumer instance
// =============================================================================

const DEAD_LETTERS_TABLE_V2: Table = Table {
    name: "dead_letters",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("message_id", &SqlType::Integer, non_null = true),
        sqlite_column!("routing_key", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("delivery_count", &SqlType::Integer, non_null = true),
        sqlite_column!("reason", &SqlType::Text, non_null = true),
        sqlite_column!("dead_lettered_at_ms", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_dead_letters_routing_key", "routing_key")],
    unique_constraints: &[],
};

const JOB_RUNS_TABLE_V2: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        sqlite_column!(
            "transitioned",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "executed_by",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
    ],
    indices: &[
        ("idx_job_runs_job_id", "job_id, id DESC"),
        ("idx_job_runs_status", "status"),
    ],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    DEAD_LETTERS_TABLE_V2.create(conn)?;
    conn.execute(
        "ALTER TABLE job_runs ADD COLUMN transitioned INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    conn.execute(
        "ALTER TABLE job_runs ADD COLUMN executed_by TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

pub static COORDINATION_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[LOCKS_TABLE_V1, WORK_QUEUE_TABLE_V1, JOB_RUNS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            LOCKS_TABLE_V1,
            WORK_QUEUE_TABLE_V1,
            JOB_RUNS_TABLE_V2,
            DEAD_LETTERS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
