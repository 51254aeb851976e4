//! Error types for Clawverse

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Clawverse core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Message does not conform to the schema (caller bug)
    #[error("validation error: {0}")]
    Validation(String),

    /// Truncated or corrupt wire bytes
    #[error("decode error: {0}")]
    Decode(String),

    /// Envelope version below the oldest one we understand
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Replicated-state delta is malformed or inconsistent
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
}

impl Error {
    /// True for errors caused by bytes received from the network
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Decode(_) | Error::UnsupportedVersion(_) | Error::InvalidDelta(_)
        )
    }
}
