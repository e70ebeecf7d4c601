//! Error types for the engine.

use std::path::PathBuf;

use sitesync_core::{CoreError, EntityKind, EventId, WorkspaceId};
use sitesync_delivery::{DeliveryError, DirectoryError};
use sitesync_store::StoreError;
use thiserror::Error;

use crate::registry::EntityError;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Model error.
    #[error("model error: {0}")]
    Model(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Delivery error.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Site directory error.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Entity source error.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Event not found.
    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// The entity source has no such entity.
    #[error("entity not found: {entity_type} {entity_id}")]
    EntityNotFound {
        entity_type: EntityKind,
        entity_id: String,
    },

    /// Workspace has no polling state or no known kind.
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(WorkspaceId),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
