//! Change detector: the entry point for mutations.
//!
//! CRUD handlers call [`ChangeDetector::notify_change`] after their write.
//! The detector diffs the allowlisted fields against the previous snapshot,
//! and if the change is sync-worthy appends a [`SyncEvent`] targeting every
//! site the workspace currently has.
//!
//! ## Key Types
//!
//! - [`ChangeNotice`] - One mutation as reported by the caller
//! - [`ChangeDetector`] - Turns notices into events
//! - [`SnapshotCache`] - Last seen allowlisted snapshot per entity

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sitesync_core::{
    detect_changes, project_payload, ChangeKind, Clock, EntityKind, EventDraft, EventId,
    EventSource, EventStatus, FieldMap, SyncEvent, WorkspaceId,
};
use sitesync_delivery::SiteDirectory;
use sitesync_store::EventLog;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::EntityRegistry;

/// One mutation of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub workspace_id: WorkspaceId,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub change: ChangeKind,
    /// Entity state after the write.
    pub current: FieldMap,
    /// Entity state before the write, if the caller has it.
    pub previous: Option<FieldMap>,
    /// Actor who made the change.
    pub actor: Option<String>,
}

impl ChangeNotice {
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        change: ChangeKind,
        current: FieldMap,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            entity_kind,
            entity_id: entity_id.into(),
            change,
            current,
            previous: None,
            actor: None,
        }
    }

    pub fn created(
        workspace_id: impl Into<WorkspaceId>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        current: FieldMap,
    ) -> Self {
        Self::new(workspace_id, entity_kind, entity_id, ChangeKind::Created, current)
    }

    pub fn updated(
        workspace_id: impl Into<WorkspaceId>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        current: FieldMap,
    ) -> Self {
        Self::new(workspace_id, entity_kind, entity_id, ChangeKind::Updated, current)
    }

    pub fn deleted(
        workspace_id: impl Into<WorkspaceId>,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        last_state: FieldMap,
    ) -> Self {
        Self::new(workspace_id, entity_kind, entity_id, ChangeKind::Deleted, last_state)
    }

    pub fn with_previous(mut self, previous: FieldMap) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    fn cache_key(&self) -> CacheKey {
        (
            self.workspace_id.clone(),
            self.entity_kind,
            self.entity_id.clone(),
        )
    }
}

/// Configuration for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// How long a cached snapshot stays usable.
    pub snapshot_ttl: Duration,
    /// Maximum cached snapshots.
    pub snapshot_capacity: usize,
    /// Capacity of the dispatch wake-up channel.
    pub wake_capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(10 * 60),
            snapshot_capacity: 10_000,
            wake_capacity: 1024,
        }
    }
}

type CacheKey = (WorkspaceId, EntityKind, String);

#[derive(Debug, Clone)]
struct CachedSnapshot {
    fields: FieldMap,
    stored_at: DateTime<Utc>,
}

/// TTL-bounded cache of the last allowlisted snapshot per entity.
///
/// Lookups never wait: a contended lock is reported as a miss.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    entries: Arc<Mutex<HashMap<CacheKey, CachedSnapshot>>>,
    ttl: chrono::Duration,
    capacity: usize,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: chrono::Duration::milliseconds(ttl.as_millis() as i64),
            capacity,
        }
    }

    fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<FieldMap> {
        let mut entries = self.entries.try_lock().ok()?;
        match entries.get(key) {
            Some(entry) if now - entry.stored_at <= self.ttl => Some(entry.fields.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: CacheKey, fields: FieldMap, now: DateTime<Utc>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| now - entry.stored_at <= ttl);
            if entries.len() >= self.capacity {
                return;
            }
        }
        entries.insert(
            key,
            CachedSnapshot {
                fields,
                stored_at: now,
            },
        );
    }

    fn evict(&self, key: &CacheKey) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns change notices into sync events.
#[derive(Clone)]
pub struct ChangeDetector {
    log: Arc<dyn EventLog>,
    directory: Arc<dyn SiteDirectory>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    cache: SnapshotCache,
    max_retries: u32,
    wake: mpsc::Sender<EventId>,
}

impl ChangeDetector {
    /// Create a detector. Ids of new pending events are sent on `wake`.
    pub fn new(
        log: Arc<dyn EventLog>,
        directory: Arc<dyn SiteDirectory>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        config: &DetectorConfig,
        max_retries: u32,
        wake: mpsc::Sender<EventId>,
    ) -> Self {
        Self {
            log,
            directory,
            registry,
            clock,
            cache: SnapshotCache::new(config.snapshot_ttl, config.snapshot_capacity),
            max_retries,
            wake,
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    /// Fire-and-forget notification.
    ///
    /// Detection runs on the ambient tokio runtime; failures are logged and
    /// never reach the caller. Without a runtime the notice is dropped with a
    /// warning and the reconciler picks the change up later.
    pub fn notify_change(&self, notice: ChangeNotice) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                workspace_id = %notice.workspace_id,
                entity_id = %notice.entity_id,
                "no tokio runtime, change notification dropped"
            );
            return;
        };
        let detector = self.clone();
        handle.spawn(async move {
            let workspace_id = notice.workspace_id.clone();
            let entity_id = notice.entity_id.clone();
            if let Err(err) = detector.record_change(notice).await {
                warn!(%workspace_id, %entity_id, error = %err, "change detection failed");
            }
        });
    }

    /// Awaitable variant of [`notify_change`](Self::notify_change).
    ///
    /// Returns the created event, or `None` if the change was not sync-worthy.
    pub async fn record_change(&self, notice: ChangeNotice) -> Result<Option<SyncEvent>> {
        self.emit(notice, EventSource::Detector).await
    }

    pub(crate) async fn emit(
        &self,
        notice: ChangeNotice,
        source: EventSource,
    ) -> Result<Option<SyncEvent>> {
        let now = self.clock.now();
        let allowlist = self.registry.allowlist(notice.entity_kind);
        let key = notice.cache_key();

        let cached = match notice.previous {
            Some(_) => None,
            None => self.cache.get(&key, now),
        };
        let previous = notice.previous.as_ref().or(cached.as_ref());
        let changes = detect_changes(&allowlist, notice.change, previous, &notice.current);
        let payload = project_payload(&allowlist, &notice.current);

        if !changes.is_sync_worthy() {
            self.remember(notice.change, key, payload, now);
            debug!(
                workspace_id = %notice.workspace_id,
                entity_type = %notice.entity_kind,
                entity_id = %notice.entity_id,
                "change touches no synced fields"
            );
            return Ok(None);
        }

        // Remember the snapshot only once the event is durable.
        let change = notice.change;
        let persisted = self
            .persist(notice, payload.clone(), changes.changed_fields, source, now)
            .await;
        let event = match persisted {
            Ok(event) => event,
            Err(err) => {
                self.cache.evict(&key);
                return Err(err);
            }
        };
        self.remember(change, key, payload, now);

        info!(
            event_id = %event.event_id,
            workspace_id = %event.workspace_id,
            event_type = %event.event_type,
            sites = event.sites_to_sync.len(),
            source = event.source.as_str(),
            "sync event created"
        );

        if event.status == EventStatus::Pending && self.wake.try_send(event.event_id).is_err() {
            debug!(event_id = %event.event_id, "wake-up channel full, leaving event to the next tick");
        }
        Ok(Some(event))
    }

    async fn persist(
        &self,
        notice: ChangeNotice,
        payload: FieldMap,
        changed_fields: Vec<String>,
        source: EventSource,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent> {
        let sites: BTreeSet<_> = self
            .directory
            .active_sites(&notice.workspace_id)
            .await?
            .into_iter()
            .map(|site| site.site_id)
            .collect();

        let draft = EventDraft {
            workspace_id: notice.workspace_id,
            entity_kind: notice.entity_kind,
            change: notice.change,
            entity_id: notice.entity_id,
            payload,
            changed_fields,
            triggered_by: notice.actor,
            source,
        };
        let event = SyncEvent::new(draft, sites, self.max_retries, now);
        self.log.create_event(&event).await?;
        Ok(event)
    }

    fn remember(&self, change: ChangeKind, key: CacheKey, payload: FieldMap, now: DateTime<Utc>) {
        match change {
            ChangeKind::Deleted => self.cache.evict(&key),
            _ => self.cache.put(key, payload, now),
        }
    }
}
