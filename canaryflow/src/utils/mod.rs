//! Shared utilities: timestamps, identifiers, fingerprints.

mod fingerprint;
mod timestamps;

pub use fingerprint::{fingerprint_value, shape_key};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};

use uuid::Uuid;

/// Generates a new random v4 UUID.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}
