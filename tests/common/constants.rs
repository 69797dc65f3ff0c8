//! Shared constants for end-to-end tests
//!
//! When seeded test data changes, update only this file.

// ============================================================================
// Seeded booking data
// ============================================================================

/// Price of the seeded service
pub const SERVICE_PRICE_CENTS: i64 = 5000;

/// Name of the seeded service, used in ledger descriptions
pub const SERVICE_NAME: &str = "Haircut";

/// Grace period used by the auto-completion job in tests
pub const GRACE_MINUTES: i64 = 3;

// ============================================================================
// Job wiring
// ============================================================================

pub const AUTO_COMPLETION_JOB: &str = "appointment_auto_completion";

pub const AUTO_COMPLETION_CRON: &str = "*/5 * * * *";

pub const AUTO_COMPLETION_ROUTING_KEY: &str = "jobs.appointment_auto_completion";
