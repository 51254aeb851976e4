//! Canonical encoding and field validation
//!
//! Replicated values and wire payloads use postcard serialization:
//! - Field order is Rust struct field order
//! - Floats must be finite
//! - Required strings must be non-empty
//!
//! The same bytes double as the tie-break key when two replicated writes carry
//! identical stamps.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Reject NaN and infinities.
pub fn ensure_finite(field: &str, v: f64) -> Result<()> {
    if v.is_nan() {
        return Err(Error::Validation(format!("{field}: NaN not allowed")));
    }
    if v.is_infinite() {
        return Err(Error::Validation(format!("{field}: infinity not allowed")));
    }
    Ok(())
}

/// Reject empty required strings.
pub fn ensure_non_empty(field: &str, v: &str) -> Result<()> {
    if v.is_empty() {
        return Err(Error::Validation(format!("missing required field: {field}")));
    }
    Ok(())
}
