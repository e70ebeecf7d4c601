//! # Sitesync Core
//!
//! Pure model for Sitesync: sync events, delivery attempts, change detection,
//! retry policy, polling state, metrics and webhook signing.
//!
//! This crate contains no I/O, no storage, no networking. Time is read through
//! the [`Clock`] trait and randomness is passed in, so every rule here can be
//! tested deterministically.
//!
//! ## Key Types
//!
//! - [`SyncEvent`] - One sync-worthy change and the sites it must reach
//! - [`WebhookDelivery`] - One HTTP attempt for an (event, site) pair
//! - [`RetryPolicy`] - Attempt budget and full-jitter backoff
//! - [`PollingState`] - Per-workspace reconciliation bookkeeping
//! - [`SyncMetrics`] - Daily per-workspace counters
//!
//! ## Webhooks
//!
//! Bodies are canonical JSON signed with HMAC-SHA256. See [`webhook`] module.

pub mod clock;
pub mod delivery;
pub mod detect;
pub mod entity;
pub mod error;
pub mod event;
pub mod metrics;
pub mod polling;
pub mod retry;
pub mod types;
pub mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{
    truncate_body, AttemptFailure, DeliveryStatus, WebhookDelivery, MAX_RESPONSE_BODY_CHARS,
};
pub use detect::{detect_changes, project_payload, ChangeSet};
pub use entity::{event_type, ChangeKind, EntityKind, EntitySnapshot, FieldMap, WorkspaceKind};
pub use error::{CoreError, Result};
pub use event::{
    EventDraft, EventSource, EventStatus, Resolution, SyncEvent, CLAIM_EXPIRED_ERROR,
    DEFAULT_MAX_RETRIES, FORCE_COMPLETED_ERROR,
};
pub use metrics::{SyncHealth, SyncMetrics};
pub use polling::{PollRun, PollingPolicy, PollingState};
pub use retry::RetryPolicy;
pub use types::{DeliveryId, EventId, SiteId, WorkspaceId};
pub use webhook::{sign, verify_signature, WebhookPayload, WebhookRequest};
