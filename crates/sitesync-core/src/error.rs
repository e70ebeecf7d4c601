//! Error types for the Sitesync core.

use thiserror::Error;

/// Errors raised by pure model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A persisted enum value could not be parsed.
    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    /// Payload encoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The webhook secret cannot be used as an HMAC key.
    #[error("invalid signing key")]
    InvalidSigningKey,

    /// A snapshot was not a JSON object.
    #[error("snapshot for {entity} must be a JSON object")]
    SnapshotNotObject { entity: String },
}

impl CoreError {
    pub(crate) fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
