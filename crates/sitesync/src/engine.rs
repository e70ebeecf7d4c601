//! The engine: wiring, worker lifecycle and the operational API.
//!
//! A [`SyncEngine`] owns one detector, one dispatcher, one reconciler and
//! one metrics aggregator over a shared event log. [`SyncEngine::start`]
//! spawns three workers on the ambient tokio runtime:
//!
//! - **dispatch**: delivers events announced on the wake-up channel, and on
//!   every tick releases stale claims and sweeps due events
//! - **polling**: runs due reconciliation sweeps
//! - **maintenance**: recomputes recent metrics and prunes old terminal events
//!
//! All workers stop on [`SyncEngine::shutdown`]. The durable log is the
//! source of truth, so nothing is lost by stopping between ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::join_all;
use sitesync_core::{
    ChangeKind, Clock, EntityKind, EventId, EventSource, EventStatus, FieldMap, PollRun,
    PollingState, SyncEvent, SyncHealth, SyncMetrics, SystemClock, WebhookDelivery, WorkspaceId,
};
use sitesync_delivery::{
    DeliveryError, DispatchReport, Dispatcher, HttpTransport, SiteDirectory, WebhookTransport,
};
use sitesync_store::{EventLog, EventLogExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::detector::{ChangeDetector, ChangeNotice};
use crate::error::{EngineError, Result};
use crate::metrics::MetricsAggregator;
use crate::reconciler::PollingReconciler;
use crate::registry::{EntityRegistry, SyncableEntity};

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    log: Arc<dyn EventLog>,
    directory: Arc<dyn SiteDirectory>,
    registry: EntityRegistry,
    transport: Option<Arc<dyn WebhookTransport>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl SyncEngineBuilder {
    pub fn registry(mut self, registry: EntityRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register one entity source.
    pub fn entity(mut self, source: Arc<dyn SyncableEntity>) -> Self {
        self.registry.register(source);
        self
    }

    /// Use `transport` instead of the default reqwest client.
    pub fn transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.http).map_err(DeliveryError::from)?),
        };
        let registry = Arc::new(self.registry);
        let (wake_tx, wake_rx) = mpsc::channel(self.config.detector.wake_capacity.max(1));

        let detector = ChangeDetector::new(
            self.log.clone(),
            self.directory.clone(),
            registry.clone(),
            self.clock.clone(),
            &self.config.detector,
            self.config.dispatch.retry.max_retries,
            wake_tx.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            self.log.clone(),
            transport,
            self.directory.clone(),
            self.clock.clone(),
            self.config.webhook_secret.clone(),
            self.config.dispatch.clone(),
        ));
        let reconciler = Arc::new(PollingReconciler::new(
            self.log.clone(),
            self.directory,
            registry.clone(),
            detector.clone(),
            self.clock.clone(),
            self.config.polling.clone(),
        ));
        let metrics = Arc::new(MetricsAggregator::new(self.log.clone(), self.clock.clone()));

        Ok(SyncEngine {
            log: self.log,
            clock: self.clock,
            config: self.config,
            registry,
            detector,
            dispatcher,
            reconciler,
            metrics,
            wake_tx,
            wake_rx: Arc::new(Mutex::new(wake_rx)),
            workers: Mutex::new(None),
        })
    }
}

struct Workers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The site-sync engine.
pub struct SyncEngine {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    registry: Arc<EntityRegistry>,
    detector: ChangeDetector,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<PollingReconciler>,
    metrics: Arc<MetricsAggregator>,
    wake_tx: mpsc::Sender<EventId>,
    wake_rx: Arc<Mutex<mpsc::Receiver<EventId>>>,
    workers: Mutex<Option<Workers>>,
}

impl SyncEngine {
    /// Start building an engine over `log` and `directory`.
    pub fn builder(log: Arc<dyn EventLog>, directory: Arc<dyn SiteDirectory>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            log,
            directory,
            registry: EntityRegistry::new(),
            transport: None,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &PollingReconciler {
        &self.reconciler
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the workers on the current tokio runtime.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(EngineError::InvalidOperation("engine already started".into()));
        }

        let token = CancellationToken::new();
        let handles = vec![
            tokio::spawn(dispatch_worker(
                self.dispatcher.clone(),
                self.wake_rx.clone(),
                self.config.dispatch_tick,
                token.clone(),
            )),
            tokio::spawn(polling_worker(
                self.reconciler.clone(),
                self.config.polling.tick,
                token.clone(),
            )),
            tokio::spawn(maintenance_worker(
                self.metrics.clone(),
                self.log.clone(),
                self.clock.clone(),
                self.config.metrics.interval,
                self.config.metrics.retention,
                token.clone(),
            )),
        ];
        *workers = Some(Workers { token, handles });

        info!(
            max_in_flight = self.config.dispatch.max_in_flight,
            dispatch_tick_ms = self.config.dispatch_tick.as_millis() as u64,
            "sync engine started"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Stop the workers, waiting up to the shutdown timeout for in-flight
    /// rounds to finish. Workers still running after that are aborted.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(Workers { token, handles }) = self.workers.lock().await.take() else {
            info!("sync engine was not started");
            return Ok(());
        };

        token.cancel();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(self.config.shutdown_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        error!(error = %err, "worker ended abnormally");
                    }
                }
                info!("sync engine stopped");
            }
            Err(_) => {
                warn!("workers did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change Intake
    // ─────────────────────────────────────────────────────────────────────────

    /// Fire-and-forget change notification. Never fails.
    pub fn notify_change(&self, notice: ChangeNotice) {
        self.detector.notify_change(notice);
    }

    /// Awaitable change notification returning the created event.
    pub async fn record_change(&self, notice: ChangeNotice) -> Result<Option<SyncEvent>> {
        self.detector.record_change(notice).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Manual Driving
    // ─────────────────────────────────────────────────────────────────────────

    /// Release stale claims, then dispatch every due event once.
    pub async fn run_dispatch_once(&self) -> Result<Vec<DispatchReport>> {
        self.dispatcher.release_stale_claims().await?;
        Ok(self.dispatcher.process_due().await?)
    }

    /// Run every due reconciliation sweep once.
    pub async fn run_polling_once(&self) -> Result<Vec<PollRun>> {
        self.reconciler.run_due().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn require_event(&self, id: EventId) -> Result<SyncEvent> {
        self.log
            .get_event(id)
            .await?
            .ok_or(EngineError::EventNotFound(id))
    }

    /// Requeue a failed or retrying event with a fresh retry budget.
    ///
    /// Returns `false` if the event is in any other state.
    pub async fn retrigger_event(&self, id: EventId) -> Result<bool> {
        self.require_event(id).await?;
        let requeued = self.log.requeue_event(id).await?;
        if requeued {
            info!(event_id = %id, "event requeued by operator");
            self.wake(id);
        }
        Ok(requeued)
    }

    /// Requeue every failed event of a workspace. Returns how many.
    pub async fn retrigger_workspace(&self, workspace_id: &WorkspaceId) -> Result<usize> {
        let failed = self
            .log
            .events_with_status(workspace_id, EventStatus::Failed)
            .await?;
        let mut requeued = 0;
        for event in failed {
            if self.log.requeue_event(event.event_id).await? {
                self.wake(event.event_id);
                requeued += 1;
            }
        }
        info!(%workspace_id, requeued, "workspace retriggered");
        Ok(requeued)
    }

    /// Re-read one entity from its source and send its current state to
    /// every site, changed or not. A soft-deleted entity is sent as deleted.
    pub async fn resync_entity(
        &self,
        workspace_id: &WorkspaceId,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<SyncEvent> {
        let source = self.registry.get(entity_kind).ok_or_else(|| {
            EngineError::InvalidOperation(format!("no entity source registered for {entity_kind}"))
        })?;
        let snapshot = source
            .snapshot(workspace_id, entity_id)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound {
                entity_type: entity_kind,
                entity_id: entity_id.to_string(),
            })?;

        let change = if snapshot.deleted {
            ChangeKind::Deleted
        } else {
            ChangeKind::Updated
        };
        // An empty previous state marks every present synced field as changed.
        let notice = ChangeNotice::new(
            workspace_id.clone(),
            entity_kind,
            entity_id,
            change,
            snapshot.fields,
        )
        .with_previous(FieldMap::new());
        let event = self
            .detector
            .emit(notice, EventSource::Manual)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidOperation(format!(
                    "{entity_kind} {entity_id} has no synced fields"
                ))
            })?;
        info!(event_id = %event.event_id, %workspace_id, %entity_id, "entity resynced by operator");
        Ok(event)
    }

    /// Operator override: declare every target site synced.
    ///
    /// Returns `false` if the event was already completed.
    pub async fn force_complete(&self, id: EventId) -> Result<bool> {
        self.require_event(id).await?;
        let completed = self.log.force_complete_event(id, self.clock.now()).await?;
        if completed {
            warn!(event_id = %id, "event force-completed by operator");
        }
        Ok(completed)
    }

    /// The event and every delivery attempt made for it.
    pub async fn event_history(&self, id: EventId) -> Result<(SyncEvent, Vec<WebhookDelivery>)> {
        self.log
            .event_history(id)
            .await?
            .ok_or(EngineError::EventNotFound(id))
    }

    /// Delete terminal events created more than `older_than` ago.
    pub async fn prune(&self, older_than: Duration) -> Result<u64> {
        let cutoff = self.clock.now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let pruned = self.log.prune_terminal_events(cutoff).await?;
        info!(pruned, %cutoff, "terminal events pruned");
        Ok(pruned)
    }

    fn wake(&self, id: EventId) {
        // A full channel only delays dispatch until the next tick.
        let _ = self.wake_tx.try_send(id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn start_polling(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        self.reconciler.start(workspace_id).await
    }

    pub async fn stop_polling(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        self.reconciler.stop(workspace_id).await
    }

    pub async fn rearm_polling(&self, workspace_id: &WorkspaceId) -> Result<PollingState> {
        self.reconciler.rearm(workspace_id).await
    }

    pub async fn polling_state(&self, workspace_id: &WorkspaceId) -> Result<Option<PollingState>> {
        Ok(self.log.get_polling_state(workspace_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Delivery success rate and event counts over the last `window`.
    pub async fn sync_health(&self, workspace_id: &WorkspaceId, window: Duration) -> Result<SyncHealth> {
        self.metrics.health(workspace_id, window).await
    }

    /// Stored daily rows for `from..=to`.
    pub async fn daily_metrics(
        &self,
        workspace_id: &WorkspaceId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SyncMetrics>> {
        self.metrics.daily(workspace_id, from, to).await
    }

    /// Recompute one workspace's row for `date`.
    pub async fn aggregate_metrics(
        &self,
        workspace_id: &WorkspaceId,
        date: NaiveDate,
    ) -> Result<SyncMetrics> {
        self.metrics.aggregate(workspace_id, date).await
    }

    /// Recompute every workspace active on `date`.
    pub async fn aggregate_day(&self, date: NaiveDate) -> Result<Vec<SyncMetrics>> {
        self.metrics.aggregate_day(date).await
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    wake: Arc<Mutex<mpsc::Receiver<EventId>>>,
    tick: Duration,
    token: CancellationToken,
) {
    let mut wake = wake.lock().await;
    let mut interval = ticker(tick);
    // Woken rounds run side by side; the dispatcher's semaphore bounds them.
    let mut rounds = JoinSet::new();
    info!("dispatch worker started");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            Some(id) = wake.recv() => {
                let dispatcher = dispatcher.clone();
                rounds.spawn(async move {
                    if let Err(err) = dispatcher.dispatch_event(id).await {
                        warn!(event_id = %id, error = %err, "dispatch round failed");
                    }
                });
            }
            Some(joined) = rounds.join_next(), if !rounds.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "dispatch round panicked");
                }
            }
            _ = interval.tick() => {
                if let Err(err) = dispatcher.release_stale_claims().await {
                    error!(error = %err, "releasing stale claims failed");
                }
                if let Err(err) = dispatcher.process_due().await {
                    error!(error = %err, "dispatch sweep failed");
                }
            }
        }
    }

    while rounds.join_next().await.is_some() {}
    info!("dispatch worker stopped");
}

async fn polling_worker(reconciler: Arc<PollingReconciler>, tick: Duration, token: CancellationToken) {
    let mut interval = ticker(tick);
    info!("polling worker started");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = reconciler.run_due().await {
                    error!(error = %err, "polling sweep failed");
                }
            }
        }
    }
    info!("polling worker stopped");
}

async fn maintenance_worker(
    metrics: Arc<MetricsAggregator>,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    period: Duration,
    retention: Option<Duration>,
    token: CancellationToken,
) {
    let mut interval = ticker(period);
    info!("maintenance worker started");

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = metrics.aggregate_recent().await {
                    error!(error = %err, "metrics aggregation failed");
                }
                if let Some(retention) = retention {
                    let cutoff = clock.now()
                        - chrono::Duration::milliseconds(retention.as_millis() as i64);
                    match log.prune_terminal_events(cutoff).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "terminal events pruned"),
                        Err(err) => error!(error = %err, "pruning failed"),
                    }
                }
            }
        }
    }
    info!("maintenance worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use sitesync_core::{EntityKind, ManualClock};
    use sitesync_delivery::directory::memory::MemoryDirectory;
    use sitesync_delivery::transport::memory::{ScriptedReply, ScriptedTransport};
    use sitesync_delivery::TargetSite;
    use sitesync_store::MemoryEventLog;

    struct Setup {
        engine: SyncEngine,
        log: Arc<MemoryEventLog>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Setup {
        let log = Arc::new(MemoryEventLog::new());
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let ws = WorkspaceId::new("ws-1");
        directory.add_site(&ws, TargetSite::new("a", "https://a.example"));

        let mut config = EngineConfig::with_secret("secret");
        config.dispatch.retry.connect_retry_base = Duration::ZERO;
        config.dispatch_tick = Duration::from_millis(10);

        let engine = SyncEngine::builder(log.clone(), directory)
            .transport(transport.clone())
            .clock(clock.clone())
            .config(config)
            .build()
            .unwrap();
        Setup {
            engine,
            log,
            transport,
            clock,
        }
    }

    fn product_update(id: &str) -> ChangeNotice {
        ChangeNotice::updated(
            "ws-1",
            EntityKind::Product,
            id,
            json!({"price": "12.00"}).as_object().cloned().unwrap(),
        )
        .with_previous(json!({"price": "10.00"}).as_object().cloned().unwrap())
    }

    #[test]
    fn test_build_rejects_missing_secret() {
        let result = SyncEngine::builder(
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemoryDirectory::new()),
        )
        .transport(Arc::new(ScriptedTransport::new()))
        .build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_workers_deliver_woken_events() {
        let s = setup();
        s.engine.start().await.unwrap();
        assert!(s.engine.start().await.is_err());

        let event = s.engine.record_change(product_update("p-1")).await.unwrap().unwrap();
        for _ in 0..200 {
            let stored = s.log.get_event(event.event_id).await.unwrap().unwrap();
            if stored.status == EventStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        s.engine.shutdown().await.unwrap();
        assert!(!s.engine.is_running().await);
        let stored = s.log.get_event(event.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
        assert_eq!(s.transport.requests().len(), 1);

        // Restart works after a clean shutdown.
        s.engine.start().await.unwrap();
        s.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_woken_events_dispatch_concurrently() {
        let log = Arc::new(MemoryEventLog::new());
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(200)));
        directory.add_site(&WorkspaceId::new("ws-1"), TargetSite::new("a", "https://a.example"));

        let mut config = EngineConfig::with_secret("secret");
        config.dispatch_tick = Duration::from_secs(3600);
        let engine = SyncEngine::builder(log.clone(), directory)
            .transport(transport.clone())
            .config(config)
            .build()
            .unwrap();
        engine.start().await.unwrap();

        let mut ids = Vec::new();
        for n in 0..5 {
            let event = engine
                .record_change(product_update(&format!("p-{n}")))
                .await
                .unwrap()
                .unwrap();
            ids.push(event.event_id);
        }
        for _ in 0..200 {
            if transport.requests().len() == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.shutdown().await.unwrap();

        assert!(transport.peak_in_flight() > 1);
        for id in ids {
            let stored = log.get_event(id).await.unwrap().unwrap();
            assert_eq!(stored.status, EventStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_ok() {
        let s = setup();
        s.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retrigger_failed_event() {
        let s = setup();
        s.transport.always("https://a.example", ScriptedReply::status(500));

        let event = s.engine.record_change(product_update("p-1")).await.unwrap().unwrap();
        for _ in 0..8 {
            let reports = s.engine.run_dispatch_once().await.unwrap();
            if let Some(at) = reports.first().and_then(|r| r.next_retry_at) {
                s.clock.set(at);
            }
        }
        let (failed, _) = s.engine.event_history(event.event_id).await.unwrap();
        assert_eq!(failed.status, EventStatus::Failed);

        s.transport.always("https://a.example", ScriptedReply::ok());
        assert!(s.engine.retrigger_event(event.event_id).await.unwrap());
        assert!(!s.engine.retrigger_event(event.event_id).await.unwrap());

        s.engine.run_dispatch_once().await.unwrap();
        let (done, deliveries) = s.engine.event_history(event.event_id).await.unwrap();
        assert_eq!(done.status, EventStatus::Completed);
        assert_eq!(deliveries.len(), 9);
        assert_eq!(deliveries.last().unwrap().attempt_number, 9);
    }

    #[tokio::test]
    async fn test_retrigger_workspace_requeues_failed_only() {
        let s = setup();
        s.transport.always("https://a.example", ScriptedReply::Refused);
        let failing = s.engine.record_change(product_update("p-1")).await.unwrap().unwrap();
        for _ in 0..8 {
            let reports = s.engine.run_dispatch_once().await.unwrap();
            if let Some(at) = reports.first().and_then(|r| r.next_retry_at) {
                s.clock.set(at);
            }
        }
        let pending = s.engine.record_change(product_update("p-2")).await.unwrap().unwrap();

        let requeued = s
            .engine
            .retrigger_workspace(&WorkspaceId::new("ws-1"))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        let (failing, _) = s.engine.event_history(failing.event_id).await.unwrap();
        assert_eq!(failing.status, EventStatus::Pending);
        assert_eq!(failing.retry_count, 0);
        let (pending, _) = s.engine.event_history(pending.event_id).await.unwrap();
        assert_eq!(pending.status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn test_force_complete() {
        let s = setup();
        let event = s.engine.record_change(product_update("p-1")).await.unwrap().unwrap();
        assert!(s.engine.force_complete(event.event_id).await.unwrap());
        assert!(!s.engine.force_complete(event.event_id).await.unwrap());

        let (done, _) = s.engine.event_history(event.event_id).await.unwrap();
        assert_eq!(done.status, EventStatus::Completed);
        assert!(done.is_fully_synced());
        assert!(s.engine.run_dispatch_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_operations() {
        let s = setup();
        let missing = EventId::new();
        assert!(matches!(
            s.engine.retrigger_event(missing).await,
            Err(EngineError::EventNotFound(_))
        ));
        assert!(matches!(
            s.engine.event_history(missing).await,
            Err(EngineError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_and_open_events() {
        let s = setup();
        let done = s.engine.record_change(product_update("p-1")).await.unwrap().unwrap();
        s.engine.run_dispatch_once().await.unwrap();
        s.transport.always("https://a.example", ScriptedReply::status(500));
        let open = s.engine.record_change(product_update("p-2")).await.unwrap().unwrap();
        s.engine.run_dispatch_once().await.unwrap();

        s.clock.advance(chrono::Duration::days(31));
        assert_eq!(s.engine.prune(Duration::from_secs(30 * 24 * 3600)).await.unwrap(), 1);
        assert!(s.log.get_event(done.event_id).await.unwrap().is_none());
        assert!(s.log.get_event(open.event_id).await.unwrap().is_some());
    }
}
