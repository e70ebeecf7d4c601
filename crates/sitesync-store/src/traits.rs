//! EventLog trait: the abstract interface for sync persistence.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sitesync_core::{
    EntityKind, EventId, EventStatus, PollRun, PollingState, Resolution, SiteId, SyncEvent,
    SyncMetrics, WebhookDelivery, WorkspaceId,
};

use crate::error::Result;

/// Query over stored events.
///
/// Every field narrows the result; the default matches everything. Results
/// are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub workspace_id: Option<WorkspaceId>,
    pub status: Option<EventStatus>,
    pub entity_type: Option<EntityKind>,
    pub entity_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn workspace(workspace_id: &WorkspaceId) -> Self {
        Self {
            workspace_id: Some(workspace_id.clone()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self.created_until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes the filter, ignoring `limit`.
    pub fn matches(&self, event: &SyncEvent) -> bool {
        self.workspace_id
            .as_ref()
            .map_or(true, |ws| &event.workspace_id == ws)
            && self.status.map_or(true, |s| event.status == s)
            && self.entity_type.map_or(true, |k| event.entity_type == k)
            && self
                .entity_id
                .as_ref()
                .map_or(true, |id| &event.entity_id == id)
            && self.created_since.map_or(true, |t| event.created_at >= t)
            && self.created_until.map_or(true, |t| event.created_at < t)
    }
}

/// The EventLog trait: async interface for events, deliveries, polling state
/// and metrics.
///
/// All methods are async to support both blocking (SQLite) and async
/// backends. For SQLite, `spawn_blocking` is used internally.
///
/// # Concurrency
///
/// Every status transition is a compare-and-set applied under the store's
/// serialized write path. When several workers race to claim the same event,
/// exactly one receives it.
#[async_trait]
pub trait EventLog: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Event Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a newly created event.
    async fn create_event(&self, event: &SyncEvent) -> Result<()>;

    /// Get an event by id.
    async fn get_event(&self, id: EventId) -> Result<Option<SyncEvent>>;

    /// Events a dispatcher may claim at `now`: `pending`, or `retrying` with
    /// `next_retry_at` elapsed. Oldest first.
    async fn list_due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncEvent>>;

    /// Atomically move a due event to `processing`.
    ///
    /// Returns the claimed event, or `None` if it was not due (including when
    /// another worker claimed it first).
    async fn claim_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<SyncEvent>>;

    /// Add `site` to the event's synced set.
    ///
    /// Idempotent. Returns `true` if the site was newly marked.
    async fn mark_site_synced(&self, id: EventId, site: &SiteId) -> Result<bool>;

    /// Finish a dispatch round: CAS from `processing` to the resolution's
    /// status.
    ///
    /// Returns `false` if the event was no longer `processing`.
    async fn finish_event(
        &self,
        id: EventId,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a `failed` or `retrying` event back to `pending` with a fresh
    /// retry budget.
    async fn requeue_event(&self, id: EventId) -> Result<bool>;

    /// Operator override: mark every target site synced and complete.
    ///
    /// Unfinished delivery rows for the event are closed as `failed`.
    async fn force_complete_event(&self, id: EventId, now: DateTime<Utc>) -> Result<bool>;

    /// Resolve `processing` claims taken at or before `cutoff`.
    ///
    /// The abandoned round's `sending` rows are closed as `failed`.
    /// Returns the number of events released.
    async fn release_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<u64>;

    /// Delete terminal events created before `cutoff`, with their deliveries.
    async fn prune_terminal_events(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Events matching `filter`, newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<SyncEvent>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a delivery row.
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Overwrite a delivery row with its progressed state.
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// All attempts for one event, ordered by site then attempt number.
    async fn deliveries_for_event(&self, id: EventId) -> Result<Vec<WebhookDelivery>>;

    /// Attempts for a workspace sent (or, if unsent, scheduled) within
    /// `[since, until)`.
    async fn list_deliveries(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Polling Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the polling state of a workspace.
    async fn get_polling_state(&self, workspace_id: &WorkspaceId) -> Result<Option<PollingState>>;

    /// Insert or replace the polling state of a workspace.
    async fn upsert_polling_state(&self, state: &PollingState) -> Result<()>;

    /// Active workspaces whose `next_poll_at` has elapsed.
    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<PollingState>>;

    /// Take the sweep lease: CAS `next_poll_at` from `expected` to
    /// `lease_until`, provided polling is active and `expected <= now`.
    async fn claim_poll_lease(
        &self,
        workspace_id: &WorkspaceId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Append a sweep log entry.
    async fn record_poll_run(&self, run: &PollRun) -> Result<()>;

    /// Sweeps for a workspace started within `[since, until)`.
    async fn list_poll_runs(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PollRun>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace the metrics row for (workspace, date).
    async fn upsert_metrics(&self, metrics: &SyncMetrics) -> Result<()>;

    /// Metrics rows for a workspace with `from <= date <= to`, oldest first.
    async fn list_metrics(
        &self,
        workspace_id: &WorkspaceId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SyncMetrics>>;

    /// Workspaces with events, deliveries or sweeps within `[since, until)`.
    async fn active_workspaces(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkspaceId>>;
}

/// Convenience queries built from [`EventLog`] primitives.
#[async_trait]
pub trait EventLogExt: EventLog {
    /// Events of one workspace in one status, newest first.
    async fn events_with_status(
        &self,
        workspace_id: &WorkspaceId,
        status: EventStatus,
    ) -> Result<Vec<SyncEvent>> {
        self.list_events(&EventFilter::workspace(workspace_id).with_status(status))
            .await
    }

    /// Newest event for one entity.
    async fn latest_event_for_entity(
        &self,
        workspace_id: &WorkspaceId,
        entity_type: EntityKind,
        entity_id: &str,
    ) -> Result<Option<SyncEvent>> {
        let filter = EventFilter {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.to_string()),
            ..EventFilter::workspace(workspace_id).limit(1)
        };
        Ok(self.list_events(&filter).await?.into_iter().next())
    }

    /// The metrics row for (workspace, date).
    async fn get_metrics(
        &self,
        workspace_id: &WorkspaceId,
        date: NaiveDate,
    ) -> Result<Option<SyncMetrics>> {
        Ok(self
            .list_metrics(workspace_id, date, date)
            .await?
            .into_iter()
            .next())
    }

    /// Event together with every delivery attempt made for it.
    async fn event_history(
        &self,
        id: EventId,
    ) -> Result<Option<(SyncEvent, Vec<WebhookDelivery>)>> {
        let Some(event) = self.get_event(id).await? else {
            return Ok(None);
        };
        let deliveries = self.deliveries_for_event(id).await?;
        Ok(Some((event, deliveries)))
    }
}

impl<L: EventLog + ?Sized> EventLogExt for L {}
