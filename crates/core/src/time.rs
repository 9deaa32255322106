//! Epoch-time helpers.
//!
//! The dispatch domain deals exclusively in whole epoch seconds: due times,
//! `scheduled_time` and `processed_time` stamps are all `i64` seconds since
//! the Unix epoch, matching the wire format.

use chrono::Utc;

/// Current time as whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
