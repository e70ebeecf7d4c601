//! Error types for the delivery module.

use thiserror::Error;

/// Why a single HTTP request produced no response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not finish within the time box.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established (refused, DNS, TLS).
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other request failure.
    #[error("request failed: {0}")]
    Request(String),

    /// The target URL could not be used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Failures worth a fast retry inside the same attempt.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

/// Failure reported by a [`SiteDirectory`](crate::SiteDirectory).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("site directory error: {0}")]
pub struct DirectoryError(pub String);

/// Errors that can occur while dispatching events.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Event log operation failed.
    #[error("store error: {0}")]
    Store(#[from] sitesync_store::StoreError),

    /// Payload encoding or signing failed.
    #[error("model error: {0}")]
    Model(#[from] sitesync_core::CoreError),

    /// The site directory could not be queried.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The HTTP client could not be built.
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    /// The dispatcher is shutting down.
    #[error("dispatcher shut down")]
    Shutdown,
}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;
