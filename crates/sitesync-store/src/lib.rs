//! # Sitesync Store
//!
//! Durable event log for Sitesync. Provides a trait-based interface for
//! events, delivery attempts, polling state and metrics with SQLite and
//! in-memory implementations.
//!
//! ## Overview
//!
//! The store abstracts persistence behind the [`EventLog`] trait, allowing
//! the engine to be storage-agnostic. The primary implementation is
//! [`SqliteEventLog`], with [`MemoryEventLog`] for testing.
//!
//! ## Key Types
//!
//! - [`EventLog`] - The async trait for all storage operations
//! - [`SqliteEventLog`] - SQLite-based persistent storage
//! - [`MemoryEventLog`] - In-memory storage for tests
//! - [`EventFilter`] - Query over stored events
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sitesync_store::{EventLog, SqliteEventLog};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let log = SqliteEventLog::open("sitesync.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let log = SqliteEventLog::open_memory().unwrap();
//!
//!     let due = log.list_due_events(chrono::Utc::now(), 50).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Compare-and-set transitions**: claiming, finishing, requeueing and
//!   force-completing an event only succeed from the expected status
//! - **Idempotent site marking**: marking a site twice is a no-op
//! - **Append-only attempts**: each delivery attempt is its own row, unique
//!   per (event, site, attempt number)

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;
pub use traits::{EventFilter, EventLog, EventLogExt};
