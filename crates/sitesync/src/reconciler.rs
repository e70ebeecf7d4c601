//! Polling reconciler: the backstop for missed change notifications.
//!
//! Every active workspace is swept on a fixed cadence. A sweep asks each
//! entity source of the workspace's kind for rows modified since the last
//! successful sweep and runs them through the change detector. Rows that
//! already have an event created at or after their last modification are
//! skipped.
//!
//! Sweeps never overlap: a sweep first takes a lease by CAS-advancing the
//! workspace's `next_poll_at`.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use sitesync_core::{
    Clock, EventSource, PollRun, PollingPolicy, PollingState, WorkspaceId,
};
use sitesync_delivery::SiteDirectory;
use sitesync_store::{EventLog, EventLogExt};
use tracing::{debug, error, info, warn};

use crate::detector::{ChangeDetector, ChangeNotice};
use crate::error::{EngineError, Result};
use crate::registry::EntityRegistry;

/// Configuration for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub policy: PollingPolicy,
    /// How often the worker looks for due workspaces.
    pub tick: Duration,
    /// Sweeps run concurrently per tick.
    pub max_concurrent_sweeps: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            policy: PollingPolicy::default(),
            tick: Duration::from_secs(5),
            max_concurrent_sweeps: 4,
        }
    }
}

/// Sweeps workspaces for changes the detector never saw.
pub struct PollingReconciler {
    log: Arc<dyn EventLog>,
    directory: Arc<dyn SiteDirectory>,
    registry: Arc<EntityRegistry>,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
    config: PollingConfig,
}

impl PollingReconciler {
    pub fn new(
        log: Arc<dyn EventLog>,
        directory: Arc<dyn SiteDirectory>,
        registry: Arc<EntityRegistry>,
        detector: ChangeDetector,
        clock: Arc<dyn Clock>,
        config: PollingConfig,
    ) -> Self {
        Self {
            log,
            directory,
            registry,
            detector,
            clock,
            config,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start polling a workspace, or resume it if it was stopped.
    pub async fn start(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        let now = self.clock.now();
        let state = match self.log.get_polling_state(workspace_id).await? {
            Some(mut state) => {
                if !state.is_polling_active {
                    state.rearm(&self.config.policy, now);
                }
                state
            }
            None => PollingState::start(workspace_id.clone(), &self.config.policy, now),
        };
        self.log.upsert_polling_state(&state).await?;
        info!(%workspace_id, next_poll_at = %state.next_poll_at, "polling started");
        Ok(state)
    }

    /// Stop polling a workspace.
    pub async fn stop(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        let mut state = self.existing(workspace_id).await?;
        state.stop();
        self.log.upsert_polling_state(&state).await?;
        info!(%workspace_id, "polling stopped");
        Ok(state)
    }

    /// Re-enable a workspace that disabled itself; the next tick sweeps it.
    pub async fn rearm(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        let mut state = self.existing(workspace_id).await?;
        state.rearm(&self.config.policy, self.clock.now());
        self.log.upsert_polling_state(&state).await?;
        info!(%workspace_id, "polling re-armed");
        Ok(state)
    }

    async fn existing(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        self.log
            .get_polling_state(workspace_id)
            .await?
            .ok_or_else(|| EngineError::UnknownWorkspace(workspace_id.clone()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sweeps
    // ─────────────────────────────────────────────────────────────────────────

    /// Sweep every due workspace, a bounded number at a time.
    ///
    /// Returns the runs actually executed; workspaces whose lease was taken
    /// elsewhere are skipped.
    pub async fn run_due(&self) -> Result<Vec<PollRun>> {
        let due = self.log.list_due_polling(self.clock.now()).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = due.len(), "sweeping due workspaces");

        let results: Vec<(WorkspaceId, Result<Option<PollRun>>)> = stream::iter(due)
            .map(|state| async move {
                let workspace_id = state.workspace_id.clone();
                (workspace_id, self.sweep(state).await)
            })
            .buffer_unordered(self.config.max_concurrent_sweeps.max(1))
            .collect()
            .await;

        let mut runs = Vec::new();
        for (workspace_id, result) in results {
            match result {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => error!(%workspace_id, error = %err, "sweep bookkeeping failed"),
            }
        }
        Ok(runs)
    }

    /// Sweep one workspace if its lease can be taken.
    pub async fn sweep(&self, state: PollingState) -> Result<Option<PollRun>> {
        let started_at = self.clock.now();
        let workspace_id = state.workspace_id.clone();
        let lease_until = PollingState::lease_until(&self.config.policy, started_at);
        if !self
            .log
            .claim_poll_lease(&workspace_id, state.next_poll_at, started_at, lease_until)
            .await?
        {
            debug!(%workspace_id, "sweep lease not available");
            return Ok(None);
        }

        let outcome = self.scan(&state).await;
        let finished_at = self.clock.now();

        // Operators may have stopped the workspace while the sweep ran.
        let mut state = self
            .log
            .get_polling_state(&workspace_id)
            .await?
            .unwrap_or(state);
        let run = match outcome {
            Ok(changes) => {
                state.record_success(&self.config.policy, started_at, changes, finished_at);
                if changes > 0 {
                    info!(%workspace_id, changes, "sweep found missed changes");
                }
                PollRun {
                    workspace_id: workspace_id.clone(),
                    started_at,
                    finished_at,
                    changes_detected: changes,
                    error: None,
                }
            }
            Err(err) => {
                let message = err.to_string();
                state.record_failure(&self.config.policy, &message, finished_at);
                warn!(
                    %workspace_id,
                    failures = state.consecutive_failures,
                    error = %message,
                    "sweep failed"
                );
                if !state.is_polling_active {
                    error!(%workspace_id, "polling disabled after repeated failures");
                }
                PollRun {
                    workspace_id: workspace_id.clone(),
                    started_at,
                    finished_at,
                    changes_detected: 0,
                    error: Some(message),
                }
            }
        };

        self.log.upsert_polling_state(&state).await?;
        self.log.record_poll_run(&run).await?;
        Ok(Some(run))
    }

    /// Emit events for rows modified since the cursor. Returns how many.
    async fn scan(&self, state: &PollingState) -> Result<u32> {
        let workspace_id = &state.workspace_id;
        let kind = self
            .directory
            .workspace_kind(workspace_id)
            .await?
            .ok_or_else(|| EngineError::UnknownWorkspace(workspace_id.clone()))?;

        let mut emitted = 0;
        for entity_kind in kind.entity_kinds() {
            let Some(source) = self.registry.get(*entity_kind) else {
                debug!(%workspace_id, entity_type = %entity_kind, "no entity source registered");
                continue;
            };

            for snapshot in source.modified_since(workspace_id, state.last_poll_at).await? {
                let covered = self
                    .log
                    .latest_event_for_entity(workspace_id, *entity_kind, &snapshot.entity_id)
                    .await?
                    .is_some_and(|event| event.created_at >= snapshot.updated_at);
                if covered {
                    continue;
                }

                let notice = ChangeNotice::new(
                    workspace_id.clone(),
                    *entity_kind,
                    snapshot.entity_id.clone(),
                    snapshot.change_since(state.last_poll_at),
                    snapshot.fields,
                );
                if self
                    .detector
                    .emit(notice, EventSource::Reconciler)
                    .await?
                    .is_some()
                {
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::registry::{EntityError, SyncableEntity};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use sitesync_core::{EntityKind, EntitySnapshot, ManualClock, WorkspaceKind};
    use sitesync_delivery::directory::memory::MemoryDirectory;
    use sitesync_delivery::TargetSite;
    use sitesync_store::MemoryEventLog;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Services {
        rows: Mutex<Vec<EntitySnapshot>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl SyncableEntity for Services {
        fn entity_kind(&self) -> EntityKind {
            EntityKind::Service
        }

        async fn snapshot(
            &self,
            _workspace_id: &WorkspaceId,
            entity_id: &str,
        ) -> std::result::Result<Option<EntitySnapshot>, EntityError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().find(|r| r.entity_id == entity_id).cloned())
        }

        async fn modified_since(
            &self,
            workspace_id: &WorkspaceId,
            since: Option<DateTime<Utc>>,
        ) -> std::result::Result<Vec<EntitySnapshot>, EntityError> {
            if *self.fail.lock().unwrap() {
                return Err(EntityError("database unavailable".into()));
            }
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|r| &r.workspace_id == workspace_id)
                .filter(|r| since.map_or(true, |since| r.updated_at > since))
                .cloned()
                .collect())
        }
    }

    struct Setup {
        reconciler: PollingReconciler,
        detector: ChangeDetector,
        log: Arc<MemoryEventLog>,
        directory: Arc<MemoryDirectory>,
        services: Arc<Services>,
        clock: Arc<ManualClock>,
        ws: WorkspaceId,
    }

    fn setup() -> Setup {
        let log = Arc::new(MemoryEventLog::new());
        let directory = Arc::new(MemoryDirectory::new());
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let services = Arc::new(Services::default());
        let registry = Arc::new(EntityRegistry::new().with(services.clone()));
        let ws = WorkspaceId::new("ws-svc");
        directory.set_kind(&ws, WorkspaceKind::Services);
        directory.add_site(&ws, TargetSite::new("a", "https://a.example"));

        let (tx, _rx) = mpsc::channel(16);
        let detector = ChangeDetector::new(
            log.clone(),
            directory.clone(),
            registry.clone(),
            clock.clone(),
            &DetectorConfig::default(),
            8,
            tx,
        );
        let reconciler = PollingReconciler::new(
            log.clone(),
            directory.clone(),
            registry,
            detector.clone(),
            clock.clone(),
            PollingConfig::default(),
        );
        Setup {
            reconciler,
            detector,
            log,
            directory,
            services,
            clock,
            ws,
        }
    }

    fn service_row(ws: &WorkspaceId, id: &str, at: DateTime<Utc>) -> EntitySnapshot {
        EntitySnapshot {
            workspace_id: ws.clone(),
            entity_kind: EntityKind::Service,
            entity_id: id.into(),
            fields: json!({"name": "Haircut", "price": "30.00"})
                .as_object()
                .cloned()
                .unwrap(),
            created_at: at,
            updated_at: at,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_sweep_catches_missed_create() {
        let s = setup();
        s.reconciler.start(&s.ws).await.unwrap();

        s.clock.advance(chrono::Duration::seconds(10));
        s.services
            .rows
            .lock()
            .unwrap()
            .push(service_row(&s.ws, "svc-1", s.clock.now()));

        s.clock.advance(chrono::Duration::seconds(60));
        let runs = s.reconciler.run_due().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].changes_detected, 1);

        let event = s
            .log
            .latest_event_for_entity(&s.ws, EntityKind::Service, "svc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "service.created");
        assert_eq!(event.source, EventSource::Reconciler);

        let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_change_detected_at.is_some());
        assert!(state.next_poll_at > s.clock.now());
    }

    #[tokio::test]
    async fn test_sweep_recovers_change_whose_detection_failed() {
        let s = setup();
        let row = service_row(&s.ws, "svc-1", s.clock.now());
        s.services.rows.lock().unwrap().push(row.clone());
        let created = ChangeNotice::created(
            s.ws.clone(),
            EntityKind::Service,
            "svc-1",
            row.fields.clone(),
        );
        assert!(s.detector.record_change(created).await.unwrap().is_some());
        s.reconciler.start(&s.ws).await.unwrap();

        s.clock.advance(chrono::Duration::seconds(10));
        let mut repriced = row.clone();
        repriced.fields.insert("price".into(), json!("35.00"));
        repriced.updated_at = s.clock.now();
        *s.services.rows.lock().unwrap() = vec![repriced.clone()];

        s.directory.set_failing(Some("directory offline"));
        let updated = ChangeNotice::updated(
            s.ws.clone(),
            EntityKind::Service,
            "svc-1",
            repriced.fields.clone(),
        )
        .with_previous(row.fields.clone());
        assert!(s.detector.record_change(updated).await.is_err());
        s.directory.set_failing(None);

        s.clock.advance(chrono::Duration::seconds(60));
        let runs = s.reconciler.run_due().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].changes_detected, 1);

        let event = s
            .log
            .latest_event_for_entity(&s.ws, EntityKind::Service, "svc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.source, EventSource::Reconciler);
        assert_eq!(event.payload["price"], "35.00");
    }

    #[tokio::test]
    async fn test_covered_entities_are_skipped() {
        let s = setup();
        s.reconciler.start(&s.ws).await.unwrap();
        s.clock.advance(chrono::Duration::seconds(70));
        s.services
            .rows
            .lock()
            .unwrap()
            .push(service_row(&s.ws, "svc-1", s.clock.now()));
        assert_eq!(s.reconciler.run_due().await.unwrap()[0].changes_detected, 1);

        // The row is still "modified" relative to a cursor before it, but an
        // event newer than its modification exists.
        let mut state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
        state.last_poll_at = Some(s.clock.now() - chrono::Duration::seconds(1));
        state.next_poll_at = s.clock.now();
        s.log.upsert_polling_state(&state).await.unwrap();

        let runs = s.reconciler.run_due().await.unwrap();
        assert_eq!(runs[0].changes_detected, 0);
    }

    #[tokio::test]
    async fn test_tick_before_due_is_noop() {
        let s = setup();
        s.reconciler.start(&s.ws).await.unwrap();
        assert!(s.reconciler.run_due().await.unwrap().is_empty());

        let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
        assert!(s.reconciler.sweep(state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_take_one_lease() {
        let s = setup();
        s.reconciler.start(&s.ws).await.unwrap();
        s.clock.advance(chrono::Duration::seconds(61));
        let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();

        let (a, b) = tokio::join!(
            s.reconciler.sweep(state.clone()),
            s.reconciler.sweep(state)
        );
        let executed = [a.unwrap(), b.unwrap()].iter().filter(|r| r.is_some()).count();
        assert_eq!(executed, 1);
    }

    #[tokio::test]
    async fn test_failures_back_off_then_disable() {
        let s = setup();
        s.reconciler.start(&s.ws).await.unwrap();
        *s.services.fail.lock().unwrap() = true;

        for failures in 1..=10u32 {
            let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
            s.clock.set(state.next_poll_at);
            let runs = s.reconciler.run_due().await.unwrap();
            assert_eq!(runs.len(), 1);
            assert!(!runs[0].succeeded());

            let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
            assert_eq!(state.consecutive_failures, failures);
            let backoff = (60 * failures as i64).min(30 * 60);
            assert_eq!(
                state.next_poll_at - s.clock.now(),
                chrono::Duration::seconds(backoff)
            );
        }

        let state = s.log.get_polling_state(&s.ws).await.unwrap().unwrap();
        assert!(!state.is_polling_active);
        assert!(state.last_error.as_deref().unwrap().contains("database unavailable"));

        s.clock.advance(chrono::Duration::hours(1));
        assert!(s.reconciler.run_due().await.unwrap().is_empty());

        *s.services.fail.lock().unwrap() = false;
        let rearmed = s.reconciler.rearm(&s.ws).await.unwrap();
        assert!(rearmed.is_polling_active);
        assert_eq!(s.reconciler.run_due().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workspace_kind_fails_sweep() {
        let s = setup();
        let other = WorkspaceId::new("ws-unknown");
        s.reconciler.start(&other).await.unwrap();
        s.clock.advance(chrono::Duration::seconds(61));

        let runs = s.reconciler.run_due().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].error.as_deref().unwrap().contains("unknown workspace"));
    }

    #[tokio::test]
    async fn test_stop_requires_known_workspace() {
        let s = setup();
        let err = s.reconciler.stop(&WorkspaceId::new("nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkspace(_)));

        s.reconciler.start(&s.ws).await.unwrap();
        let stopped = s.reconciler.stop(&s.ws).await.unwrap();
        assert!(!stopped.is_polling_active);
    }
}
