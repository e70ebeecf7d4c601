//! # Sitesync
//!
//! Keeps deployed sites in step with the workspace they were generated
//! from. Entity writes in the workspace become durable sync events; each
//! event is delivered to every active site as an HMAC-signed webhook and
//! retried with jittered backoff until it lands or its budget runs out.
//!
//! ## Overview
//!
//! - **Detection**: [`ChangeDetector`] diffs an entity write against the
//!   field allowlist of its kind and records an event only when a synced
//!   field changed
//! - **Delivery**: [`Dispatcher`](delivery::Dispatcher) claims due events,
//!   fans out to pending sites under a concurrency bound, and resolves the
//!   round as completed, retry or failed
//! - **Reconciliation**: [`PollingReconciler`] periodically scans entity
//!   sources for writes the detector never saw
//! - **Metrics**: [`MetricsAggregator`] derives daily counters and a rolling
//!   health view from the log
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sitesync::{ChangeNotice, EngineConfig, SyncEngine};
//! use sitesync::core::EntityKind;
//! use sitesync::delivery::directory::memory::MemoryDirectory;
//! use sitesync::store::SqliteEventLog;
//!
//! async fn example() -> sitesync::Result<()> {
//!     let log = Arc::new(SqliteEventLog::open("sitesync.db")?);
//!     let directory = Arc::new(MemoryDirectory::new());
//!
//!     let engine = SyncEngine::builder(log, directory)
//!         .config(EngineConfig::load("sitesync.toml".as_ref())?)
//!         .build()?;
//!     engine.start().await?;
//!
//!     let current = serde_json::json!({"price": "12.00"});
//!     engine.notify_change(ChangeNotice::updated(
//!         "ws-1",
//!         EntityKind::Product,
//!         "p-1",
//!         current.as_object().cloned().unwrap_or_default(),
//!     ));
//!
//!     engine.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `sitesync::core` - Data model, change detection, retry and signing
//! - `sitesync::store` - Event log trait, in-memory and SQLite backends
//! - `sitesync::delivery` - Dispatcher, transports and site directory

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod telemetry;

pub use sitesync_core as core;
pub use sitesync_delivery as delivery;
pub use sitesync_store as store;

pub use config::{EngineConfig, SECRET_ENV};
pub use detector::{ChangeDetector, ChangeNotice, DetectorConfig, SnapshotCache};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ConfigError, EngineError, Result};
pub use metrics::{MetricsAggregator, MetricsConfig};
pub use reconciler::{PollingConfig, PollingReconciler};
pub use registry::{EntityError, EntityRegistry, SyncableEntity};

pub use sitesync_core::{
    ChangeKind, EntityKind, EntitySnapshot, EventId, EventStatus, FieldMap, SiteId, SyncEvent,
    SyncHealth, SyncMetrics, WebhookDelivery, WorkspaceId, WorkspaceKind,
};
