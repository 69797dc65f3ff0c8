mod models;
mod schema;
mod sqlite_booking_store;

pub use models::*;
pub use schema::BOOKING_VERSIONED_SCHEMAS;
pub use sqlite_booking_store::SqliteBookingStore;
pub(crate) use sqlite_booking_store::to_unix;
