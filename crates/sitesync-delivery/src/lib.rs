//! # Sitesync Delivery
//!
//! Webhook delivery for sync events: a transport that posts signed
//! requests, and a dispatcher that fans events out to sites and resolves
//! them against the retry budget.
//!
//! ## Key Types
//!
//! - [`WebhookTransport`] - One HTTP POST, reqwest-backed in production
//! - [`SiteDirectory`] - Active sites and their base URLs per workspace
//! - [`Dispatcher`] - Claims due events and delivers them
//! - [`DispatchConfig`] - Concurrency cap, batch size, claim timeout, retry policy
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sitesync_core::SystemClock;
//! use sitesync_delivery::{
//!     directory::memory::MemoryDirectory, DispatchConfig, Dispatcher, HttpConfig,
//!     HttpTransport, SigningSecret,
//! };
//! use sitesync_store::SqliteEventLog;
//!
//! async fn example() {
//!     let log = Arc::new(SqliteEventLog::open("sitesync.db").unwrap());
//!     let transport = Arc::new(HttpTransport::new(&HttpConfig::default()).unwrap());
//!     let dispatcher = Dispatcher::new(
//!         log,
//!         transport,
//!         Arc::new(MemoryDirectory::new()),
//!         Arc::new(SystemClock),
//!         SigningSecret::new("shared-secret"),
//!         DispatchConfig::default(),
//!     );
//!
//!     let reports = dispatcher.process_due().await.unwrap();
//!     println!("dispatched {} events", reports.len());
//! }
//! ```
//!
//! ## Round Flow
//!
//! ```text
//! claim (pending|retrying -> processing)
//!   -> for each unconfirmed site, concurrently:
//!        queue/reuse attempt row -> sign -> POST (+ connection sub-retries)
//!        -> record response -> mark site synced on 2xx
//!   -> finish (processing -> completed|retrying|failed)
//!   -> queue retry_scheduled rows for failed sites
//! ```

pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use directory::{SiteDirectory, TargetSite};
pub use dispatcher::{
    DispatchConfig, DispatchReport, Dispatcher, SigningSecret, SiteOutcome,
};
pub use error::{DeliveryError, DirectoryError, Result, TransportError};
pub use transport::{HttpConfig, HttpTransport, WebhookResponse, WebhookTransport};
