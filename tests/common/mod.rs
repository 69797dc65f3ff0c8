//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::BookingFixture;
//!
//! #[test]
//! fn test_something() {
//!     let fixture = BookingFixture::new();
//!     let ctx = fixture.context();
//! }
//! ```

mod constants;
mod fixtures;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{manual_clock, test_now, BookingFixture};
