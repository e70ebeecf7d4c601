//! In-memory implementation of the EventLog trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use sitesync_core::{
    DeliveryStatus, EventId, EventStatus, PollRun, PollingState, Resolution, SiteId, SyncEvent,
    SyncMetrics, WebhookDelivery, WorkspaceId, CLAIM_EXPIRED_ERROR, FORCE_COMPLETED_ERROR,
};

use crate::error::{Result, StoreError};
use crate::traits::{EventFilter, EventLog};

/// In-memory event log.
///
/// All data is lost when the log is dropped. Thread-safe via RwLock; every
/// compare-and-set runs under the write lock.
pub struct MemoryEventLog {
    inner: RwLock<MemoryEventLogInner>,
}

#[derive(Default)]
struct MemoryEventLogInner {
    events: HashMap<EventId, SyncEvent>,

    /// Delivery rows in insertion order.
    deliveries: Vec<WebhookDelivery>,

    polling: HashMap<WorkspaceId, PollingState>,

    poll_runs: Vec<PollRun>,

    metrics: BTreeMap<(WorkspaceId, NaiveDate), SyncMetrics>,
}

impl MemoryEventLog {
    /// Create a new empty in-memory log.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryEventLogInner::default()),
        }
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn delivery_time(delivery: &WebhookDelivery) -> DateTime<Utc> {
    delivery.sent_at.unwrap_or(delivery.scheduled_at)
}

fn newest_first(mut events: Vec<SyncEvent>, limit: Option<usize>) -> Vec<SyncEvent> {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.event_id.cmp(&a.event_id))
    });
    if let Some(limit) = limit {
        events.truncate(limit);
    }
    events
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn create_event(&self, event: &SyncEvent) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.events.contains_key(&event.event_id) {
            return Err(StoreError::InvalidData(format!(
                "event {} already exists",
                event.event_id
            )));
        }
        inner.events.insert(event.event_id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<SyncEvent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.events.get(&id).cloned())
    }

    async fn list_due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncEvent>> {
        let inner = self.inner.read().unwrap();
        let mut due: Vec<SyncEvent> = inner
            .events
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_event(&self, id: EventId, now: DateTime<Utc>) -> Result<Option<SyncEvent>> {
        let mut inner = self.inner.write().unwrap();
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(None);
        };
        Ok(event.claim(now).then(|| event.clone()))
    }

    async fn mark_site_synced(&self, id: EventId, site: &SiteId) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let event = inner
            .events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        Ok(event.mark_site_synced(site))
    }

    async fn finish_event(
        &self,
        id: EventId,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(false);
        };
        if event.status != EventStatus::Processing {
            return Ok(false);
        }
        resolution.apply(event, now);
        Ok(true)
    }

    async fn requeue_event(&self, id: EventId) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner
            .events
            .get_mut(&id)
            .map_or(false, |event| event.requeue()))
    }

    async fn force_complete_event(&self, id: EventId, now: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let completed = inner
            .events
            .get_mut(&id)
            .map_or(false, |event| event.force_complete(now));
        if completed {
            for delivery in inner.deliveries.iter_mut().filter(|d| d.sync_event_id == id) {
                delivery.abandon(FORCE_COMPLETED_ERROR, now);
            }
        }
        Ok(completed)
    }

    async fn release_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let mut released = BTreeSet::new();
        for event in inner.events.values_mut() {
            let stale = event.status == EventStatus::Processing
                && event.claimed_at.map_or(true, |at| at <= cutoff);
            if stale {
                event.abandoned_resolution(now).apply(event, now);
                released.insert(event.event_id);
            }
        }
        // The abandoned round's in-flight rows never get a response.
        for delivery in inner.deliveries.iter_mut() {
            if delivery.status == DeliveryStatus::Sending
                && released.contains(&delivery.sync_event_id)
            {
                delivery.abandon(CLAIM_EXPIRED_ERROR, now);
            }
        }
        Ok(released.len() as u64)
    }

    async fn prune_terminal_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let doomed: BTreeSet<EventId> = inner
            .events
            .values()
            .filter(|e| e.status.is_terminal() && e.created_at < cutoff)
            .map(|e| e.event_id)
            .collect();
        inner.events.retain(|id, _| !doomed.contains(id));
        inner
            .deliveries
            .retain(|d| !doomed.contains(&d.sync_event_id));
        Ok(doomed.len() as u64)
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<SyncEvent>> {
        let inner = self.inner.read().unwrap();
        let matching = inner
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(newest_first(matching, filter.limit))
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let clash = inner.deliveries.iter().any(|d| {
            d.delivery_id == delivery.delivery_id
                || (d.sync_event_id == delivery.sync_event_id
                    && d.target_site_id == delivery.target_site_id
                    && d.attempt_number == delivery.attempt_number)
        });
        if clash {
            return Err(StoreError::InvalidData(format!(
                "delivery attempt {} for event {} site {} already exists",
                delivery.attempt_number, delivery.sync_event_id, delivery.target_site_id
            )));
        }
        inner.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .deliveries
            .iter_mut()
            .find(|d| d.delivery_id == delivery.delivery_id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}", delivery.delivery_id)))?;
        *row = delivery.clone();
        Ok(())
    }

    async fn deliveries_for_event(&self, id: EventId) -> Result<Vec<WebhookDelivery>> {
        let inner = self.inner.read().unwrap();
        let mut rows: Vec<WebhookDelivery> = inner
            .deliveries
            .iter()
            .filter(|d| d.sync_event_id == id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.target_site_id
                .cmp(&b.target_site_id)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        Ok(rows)
    }

    async fn list_deliveries(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>> {
        let inner = self.inner.read().unwrap();
        let mut rows: Vec<WebhookDelivery> = inner
            .deliveries
            .iter()
            .filter(|d| &d.workspace_id == workspace_id)
            .filter(|d| {
                let at = delivery_time(d);
                at >= since && at < until
            })
            .cloned()
            .collect();
        rows.sort_by_key(delivery_time);
        Ok(rows)
    }

    async fn get_polling_state(&self, workspace_id: &WorkspaceId) -> Result<Option<PollingState>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.polling.get(workspace_id).cloned())
    }

    async fn upsert_polling_state(&self, state: &PollingState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .polling
            .insert(state.workspace_id.clone(), state.clone());
        Ok(())
    }

    async fn list_due_polling(&self, now: DateTime<Utc>) -> Result<Vec<PollingState>> {
        let inner = self.inner.read().unwrap();
        let mut due: Vec<PollingState> = inner
            .polling
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_poll_at.cmp(&b.next_poll_at));
        Ok(due)
    }

    async fn claim_poll_lease(
        &self,
        workspace_id: &WorkspaceId,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let Some(state) = inner.polling.get_mut(workspace_id) else {
            return Ok(false);
        };
        if !state.is_due(now) || state.next_poll_at != expected {
            return Ok(false);
        }
        state.next_poll_at = lease_until;
        Ok(true)
    }

    async fn record_poll_run(&self, run: &PollRun) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.poll_runs.push(run.clone());
        Ok(())
    }

    async fn list_poll_runs(
        &self,
        workspace_id: &WorkspaceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PollRun>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .poll_runs
            .iter()
            .filter(|r| &r.workspace_id == workspace_id)
            .filter(|r| r.started_at >= since && r.started_at < until)
            .cloned()
            .collect())
    }

    async fn upsert_metrics(&self, metrics: &SyncMetrics) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.metrics.insert(
            (metrics.workspace_id.clone(), metrics.date),
            metrics.clone(),
        );
        Ok(())
    }

    async fn list_metrics(
        &self,
        workspace_id: &WorkspaceId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SyncMetrics>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .metrics
            .range((workspace_id.clone(), from)..=(workspace_id.clone(), to))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn active_workspaces(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WorkspaceId>> {
        let inner = self.inner.read().unwrap();
        let in_window = |at: DateTime<Utc>| at >= since && at < until;

        let mut active: BTreeSet<WorkspaceId> = BTreeSet::new();
        active.extend(
            inner
                .events
                .values()
                .filter(|e| in_window(e.created_at))
                .map(|e| e.workspace_id.clone()),
        );
        active.extend(
            inner
                .deliveries
                .iter()
                .filter(|d| in_window(delivery_time(d)))
                .map(|d| d.workspace_id.clone()),
        );
        active.extend(
            inner
                .poll_runs
                .iter()
                .filter(|r| in_window(r.started_at))
                .map(|r| r.workspace_id.clone()),
        );
        Ok(active.into_iter().collect())
    }
}
