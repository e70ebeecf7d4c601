//! Sync events: one sync-worthy change and its delivery progress.
//!
//! A [`SyncEvent`] is created once per sync-worthy mutation with the set of
//! sites that must receive it. Dispatch rounds mark sites as synced until the
//! event completes, or until the retry budget runs out.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──▶ processing ──▶ completed
//!                        │
//!                        ├──▶ retrying ──(next_retry_at elapsed)──▶ processing
//!                        │
//!                        └──▶ failed
//! ```
//!
//! An event with no target sites is born `completed`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{event_type, ChangeKind, EntityKind, FieldMap};
use crate::error::CoreError;
use crate::types::{EventId, SiteId, WorkspaceId};

/// Default number of delivery attempts per (event, site).
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Error recorded when a dispatcher's claim on an event expires.
pub const CLAIM_EXPIRED_ERROR: &str = "dispatch claim expired";

/// Error recorded when an operator force-completes an event.
pub const FORCE_COMPLETED_ERROR: &str = "force-completed by operator";

/// Processing status of a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Completed,
        EventStatus::Failed,
        EventStatus::Retrying,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Retrying => "retrying",
        }
    }

    /// Completed and failed events are never dispatched again without
    /// operator action.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::unknown("event status", s))
    }
}

/// Which component emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Emitted inline by `notify_change`.
    Detector,
    /// Emitted by a polling sweep.
    Reconciler,
    /// Emitted by an operator.
    Manual,
}

impl EventSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventSource::Detector => "detector",
            EventSource::Reconciler => "reconciler",
            EventSource::Manual => "manual",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detector" => Ok(EventSource::Detector),
            "reconciler" => Ok(EventSource::Reconciler),
            "manual" => Ok(EventSource::Manual),
            other => Err(CoreError::unknown("event source", other)),
        }
    }
}

/// Everything needed to create an event except its targets and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub workspace_id: WorkspaceId,
    pub entity_kind: EntityKind,
    pub change: ChangeKind,
    pub entity_id: String,
    /// Allowlisted fields of the entity's current state.
    pub payload: FieldMap,
    pub changed_fields: Vec<String>,
    pub triggered_by: Option<String>,
    pub source: EventSource,
}

/// One sync-worthy change, persisted in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: EventId,
    pub workspace_id: WorkspaceId,
    /// `<entity>.<created|updated|deleted>`.
    pub event_type: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub payload: FieldMap,
    pub changed_fields: Vec<String>,
    pub sites_to_sync: BTreeSet<SiteId>,
    pub sites_synced: BTreeSet<SiteId>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub triggered_by: Option<String>,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SyncEvent {
    /// Create a new event targeting `sites`.
    pub fn new(
        draft: EventDraft,
        sites: BTreeSet<SiteId>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let completed = sites.is_empty();
        Self {
            event_id: EventId::new(),
            workspace_id: draft.workspace_id,
            event_type: event_type(draft.entity_kind, draft.change),
            entity_type: draft.entity_kind,
            entity_id: draft.entity_id,
            payload: draft.payload,
            changed_fields: draft.changed_fields,
            sites_to_sync: sites,
            sites_synced: BTreeSet::new(),
            status: if completed {
                EventStatus::Completed
            } else {
                EventStatus::Pending
            },
            retry_count: 0,
            max_retries,
            triggered_by: draft.triggered_by,
            source: draft.source,
            created_at: now,
            processed_at: completed.then_some(now),
            next_retry_at: None,
            claimed_at: None,
            error_message: None,
        }
    }

    /// Sites still waiting for a successful delivery.
    pub fn pending_sites(&self) -> BTreeSet<SiteId> {
        self.sites_to_sync
            .difference(&self.sites_synced)
            .cloned()
            .collect()
    }

    pub fn is_fully_synced(&self) -> bool {
        self.sites_synced == self.sites_to_sync
    }

    /// Record a confirmed delivery to `site`.
    ///
    /// Returns `true` if the site was newly marked. Marking twice, or marking a
    /// site that was never targeted, leaves the event unchanged.
    pub fn mark_site_synced(&mut self, site: &SiteId) -> bool {
        if !self.sites_to_sync.contains(site) {
            return false;
        }
        self.sites_synced.insert(site.clone())
    }

    /// Whether a dispatcher may claim this event at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EventStatus::Pending => true,
            EventStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Retry budget left after the rounds already spent.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Take the `processing` claim if the event is due.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.status = EventStatus::Processing;
        self.claimed_at = Some(now);
        true
    }

    /// Resolution for a round whose worker vanished while holding the claim.
    ///
    /// The abandoned round counts as a failed one.
    pub fn abandoned_resolution(&self, now: DateTime<Utc>) -> Resolution {
        let error = CLAIM_EXPIRED_ERROR.to_string();
        if self.retry_count + 1 >= self.max_retries {
            Resolution::Failed { error }
        } else {
            Resolution::Retry {
                next_retry_at: now,
                error,
            }
        }
    }

    /// Put a failed or retrying event back in the queue with a fresh budget.
    ///
    /// Already-synced sites stay synced. Returns `false` for any other status.
    pub fn requeue(&mut self) -> bool {
        if !matches!(self.status, EventStatus::Failed | EventStatus::Retrying) {
            return false;
        }
        self.status = EventStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.claimed_at = None;
        self.processed_at = None;
        self.error_message = None;
        true
    }

    /// Operator override: declare every target site synced.
    ///
    /// Returns `false` if the event was already completed.
    pub fn force_complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == EventStatus::Completed {
            return false;
        }
        self.sites_synced = self.sites_to_sync.clone();
        self.status = EventStatus::Completed;
        self.processed_at = Some(now);
        self.next_retry_at = None;
        self.claimed_at = None;
        self.error_message = Some(FORCE_COMPLETED_ERROR.to_string());
        true
    }
}

/// How a dispatch round ends for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every target site is synced.
    Completed,
    /// Some sites failed and the budget allows another round.
    Retry {
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    /// Retries are exhausted.
    Failed { error: String },
}

impl Resolution {
    /// Status the event moves to.
    pub fn status(&self) -> EventStatus {
        match self {
            Resolution::Completed => EventStatus::Completed,
            Resolution::Retry { .. } => EventStatus::Retrying,
            Resolution::Failed { .. } => EventStatus::Failed,
        }
    }

    /// Apply this resolution to an event that was `processing`.
    ///
    /// A round that did not complete spends one retry.
    pub fn apply(&self, event: &mut SyncEvent, now: DateTime<Utc>) {
        event.status = self.status();
        event.claimed_at = None;
        match self {
            Resolution::Completed => {
                event.processed_at = Some(now);
                event.next_retry_at = None;
                event.error_message = None;
            }
            Resolution::Retry {
                next_retry_at,
                error,
            } => {
                event.retry_count += 1;
                event.next_retry_at = Some(*next_retry_at);
                event.error_message = Some(error.clone());
            }
            Resolution::Failed { error } => {
                event.retry_count += 1;
                event.processed_at = Some(now);
                event.next_retry_at = None;
                event.error_message = Some(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn draft() -> EventDraft {
        EventDraft {
            workspace_id: WorkspaceId::from("ws-1"),
            entity_kind: EntityKind::Product,
            change: ChangeKind::Updated,
            entity_id: "p-1".into(),
            payload: FieldMap::new(),
            changed_fields: vec!["price".into()],
            triggered_by: None,
            source: EventSource::Detector,
        }
    }

    fn sites(names: &[&str]) -> BTreeSet<SiteId> {
        names.iter().map(|s| SiteId::from(*s)).collect()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_new_event_is_pending() {
        let event = SyncEvent::new(draft(), sites(&["a", "b"]), DEFAULT_MAX_RETRIES, at(0));
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.event_type, "product.updated");
        assert_eq!(event.pending_sites(), sites(&["a", "b"]));
        assert!(event.is_due(at(0)));
    }

    #[test]
    fn test_no_sites_completes_immediately() {
        let event = SyncEvent::new(draft(), BTreeSet::new(), DEFAULT_MAX_RETRIES, at(5));
        assert_eq!(event.status, EventStatus::Completed);
        assert_eq!(event.processed_at, Some(at(5)));
        assert!(event.is_fully_synced());
    }

    #[test]
    fn test_mark_site_synced_ignores_unknown_site() {
        let mut event = SyncEvent::new(draft(), sites(&["a"]), DEFAULT_MAX_RETRIES, at(0));
        assert!(!event.mark_site_synced(&SiteId::from("z")));
        assert!(event.sites_synced.is_empty());
        assert!(event.mark_site_synced(&SiteId::from("a")));
        assert!(event.is_fully_synced());
    }

    #[test]
    fn test_retrying_event_waits_for_due_time() {
        let mut event = SyncEvent::new(draft(), sites(&["a"]), DEFAULT_MAX_RETRIES, at(0));
        event.status = EventStatus::Processing;
        Resolution::Retry {
            next_retry_at: at(10),
            error: "boom".into(),
        }
        .apply(&mut event, at(1));

        assert_eq!(event.status, EventStatus::Retrying);
        assert_eq!(event.retry_count, 1);
        assert!(!event.is_due(at(9)));
        assert!(event.is_due(at(10)));
    }

    #[test]
    fn test_failed_resolution_is_terminal() {
        let mut event = SyncEvent::new(draft(), sites(&["a"]), 1, at(0));
        Resolution::Failed {
            error: "refused".into(),
        }
        .apply(&mut event, at(3));
        assert!(event.status.is_terminal());
        assert_eq!(event.retries_remaining(), 0);
        assert!(!event.is_due(at(100)));
    }

    #[test]
    fn test_claim_only_when_due() {
        let mut event = SyncEvent::new(draft(), sites(&["a"]), DEFAULT_MAX_RETRIES, at(0));
        assert!(event.claim(at(1)));
        assert_eq!(event.status, EventStatus::Processing);
        assert_eq!(event.claimed_at, Some(at(1)));
        assert!(!event.claim(at(2)));
    }

    #[test]
    fn test_abandoned_round_spends_budget() {
        let mut event = SyncEvent::new(draft(), sites(&["a"]), 2, at(0));
        assert!(matches!(event.abandoned_resolution(at(5)), Resolution::Retry { .. }));
        event.retry_count = 1;
        assert!(matches!(event.abandoned_resolution(at(5)), Resolution::Failed { .. }));
    }

    #[test]
    fn test_requeue_resets_budget_keeps_synced_sites() {
        let mut event = SyncEvent::new(draft(), sites(&["a", "b"]), 2, at(0));
        event.mark_site_synced(&SiteId::from("a"));
        Resolution::Failed {
            error: "gone".into(),
        }
        .apply(&mut event, at(1));

        assert!(event.requeue());
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.pending_sites(), sites(&["b"]));
        assert!(!event.requeue());
    }

    #[test]
    fn test_force_complete_satisfies_invariant() {
        let mut event = SyncEvent::new(draft(), sites(&["a", "b"]), 2, at(0));
        assert!(event.force_complete(at(3)));
        assert!(event.is_fully_synced());
        assert_eq!(event.status, EventStatus::Completed);
        assert!(!event.force_complete(at(4)));
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in EventStatus::ALL {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("done".parse::<EventStatus>().is_err());
    }

    proptest! {
        #[test]
        fn prop_site_marking_is_idempotent(marks in proptest::collection::vec(0usize..4, 0..20)) {
            let names = ["a", "b", "c", "d"];
            let mut event = SyncEvent::new(draft(), sites(&names[..3]), DEFAULT_MAX_RETRIES, at(0));
            for idx in &marks {
                event.mark_site_synced(&SiteId::from(names[*idx]));
            }
            let once = event.sites_synced.clone();
            for idx in &marks {
                event.mark_site_synced(&SiteId::from(names[*idx]));
            }
            prop_assert_eq!(&event.sites_synced, &once);
            prop_assert!(event.sites_synced.is_subset(&event.sites_to_sync));
        }
    }
}
