//! # Sitesync Testkit
//!
//! Testing utilities for sitesync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: an in-memory entity source and a fully wired engine
//!   driven by a manual clock and a scripted transport
//! - **Generators**: Proptest strategies for entity rows, site sets and
//!   retry policies
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use serde_json::json;
//! use sitesync::ChangeNotice;
//! use sitesync::core::{EntityKind, WorkspaceKind};
//! use sitesync_testkit::fixtures::{fields, EngineFixture};
//!
//! async fn example() {
//!     let fx = EngineFixture::new();
//!     let ws = fx.workspace("ws-1", WorkspaceKind::Store, &["a", "b"]);
//!     fx.engine
//!         .record_change(ChangeNotice::created(
//!             ws,
//!             EntityKind::Product,
//!             "p-1",
//!             fields(json!({"name": "Mug", "price": "9.00"})),
//!         ))
//!         .await
//!         .unwrap();
//!     fx.drive(10).await;
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use sitesync_testkit::generators::{entity_fields, entity_kind};
//!
//! proptest! {
//!     #[test]
//!     fn projection_only_keeps_synced_fields(kind in entity_kind(), row in entity_kind().prop_flat_map(entity_fields)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{epoch, fields, site_url, EngineFixture, MemoryEntitySource, TEST_SECRET};
