//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: an in-memory entity source and
//! a fully wired engine over in-memory collaborators and a manual clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sitesync::{EngineConfig, EntityError, SyncEngine, SyncableEntity};
use sitesync_core::{Clock, EntityKind, EntitySnapshot, FieldMap, ManualClock, WorkspaceId, WorkspaceKind};
use sitesync_delivery::directory::memory::MemoryDirectory;
use sitesync_delivery::transport::memory::ScriptedTransport;
use sitesync_delivery::{DispatchReport, TargetSite};
use sitesync_store::MemoryEventLog;

/// Secret every fixture engine signs with.
pub const TEST_SECRET: &str = "test-webhook-secret";

/// Fixed starting instant for fixture clocks.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Turn a JSON object literal into a [`FieldMap`]. Non-objects become empty.
pub fn fields(value: serde_json::Value) -> FieldMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => FieldMap::new(),
    }
}

/// Base URL fixtures assign to a site id.
pub fn site_url(site_id: &str) -> String {
    format!("https://{site_id}.sites.test")
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity Source
// ─────────────────────────────────────────────────────────────────────────────

/// An entity table held in memory.
#[derive(Debug)]
pub struct MemoryEntitySource {
    kind: EntityKind,
    rows: Mutex<BTreeMap<(WorkspaceId, String), EntitySnapshot>>,
    failing: Mutex<Option<String>>,
}

impl MemoryEntitySource {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            rows: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(None),
        }
    }

    /// Insert or overwrite a row, keeping `created_at` of an existing one.
    pub fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        entity_id: &str,
        fields: FieldMap,
        at: DateTime<Utc>,
    ) -> EntitySnapshot {
        let mut rows = self.rows.lock().unwrap();
        let key = (workspace_id.clone(), entity_id.to_string());
        let created_at = rows.get(&key).map_or(at, |row| row.created_at);
        let row = EntitySnapshot {
            workspace_id: workspace_id.clone(),
            entity_kind: self.kind,
            entity_id: entity_id.to_string(),
            fields,
            created_at,
            updated_at: at,
            deleted: false,
        };
        rows.insert(key, row.clone());
        row
    }

    /// Soft-delete a row. Returns the tombstoned snapshot.
    pub fn soft_delete(
        &self,
        workspace_id: &WorkspaceId,
        entity_id: &str,
        at: DateTime<Utc>,
    ) -> Option<EntitySnapshot> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&(workspace_id.clone(), entity_id.to_string()))?;
        row.deleted = true;
        row.updated_at = at;
        Some(row.clone())
    }

    /// Make every read fail with `message` until cleared with `None`.
    pub fn set_failing(&self, message: Option<&str>) {
        *self.failing.lock().unwrap() = message.map(str::to_string);
    }

    fn check(&self) -> Result<(), EntityError> {
        match self.failing.lock().unwrap().as_ref() {
            Some(message) => Err(EntityError(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SyncableEntity for MemoryEntitySource {
    fn entity_kind(&self) -> EntityKind {
        self.kind
    }

    async fn snapshot(
        &self,
        workspace_id: &WorkspaceId,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, EntityError> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .get(&(workspace_id.clone(), entity_id.to_string()))
            .cloned())
    }

    async fn modified_since(
        &self,
        workspace_id: &WorkspaceId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntitySnapshot>, EntityError> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|row| &row.workspace_id == workspace_id)
            .filter(|row| since.map_or(true, |since| row.updated_at > since))
            .cloned()
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Fixture
// ─────────────────────────────────────────────────────────────────────────────

/// An engine wired to in-memory collaborators.
pub struct EngineFixture {
    pub engine: SyncEngine,
    pub log: Arc<MemoryEventLog>,
    pub directory: Arc<MemoryDirectory>,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub products: Arc<MemoryEntitySource>,
    pub posts: Arc<MemoryEntitySource>,
    pub services: Arc<MemoryEntitySource>,
    pub bookings: Arc<MemoryEntitySource>,
    pub settings: Arc<MemoryEntitySource>,
}

impl EngineFixture {
    /// Fixture with [`Self::test_config`].
    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    /// Default config with the test secret and no connect back-off delay.
    pub fn test_config() -> EngineConfig {
        let mut config = EngineConfig::with_secret(TEST_SECRET);
        config.dispatch.retry.connect_retry_base = Duration::ZERO;
        config.dispatch_tick = Duration::from_millis(10);
        config.polling.tick = Duration::from_millis(10);
        config
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let log = Arc::new(MemoryEventLog::new());
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let products = Arc::new(MemoryEntitySource::new(EntityKind::Product));
        let posts = Arc::new(MemoryEntitySource::new(EntityKind::Post));
        let services = Arc::new(MemoryEntitySource::new(EntityKind::Service));
        let bookings = Arc::new(MemoryEntitySource::new(EntityKind::Booking));
        let settings = Arc::new(MemoryEntitySource::new(EntityKind::Settings));

        let engine = SyncEngine::builder(log.clone(), directory.clone())
            .entity(products.clone())
            .entity(posts.clone())
            .entity(services.clone())
            .entity(bookings.clone())
            .entity(settings.clone())
            .transport(transport.clone())
            .clock(clock.clone())
            .config(config)
            .build()
            .expect("fixture config is valid");

        Self {
            engine,
            log,
            directory,
            transport,
            clock,
            products,
            posts,
            services,
            bookings,
            settings,
        }
    }

    /// Register a workspace of `kind` with one site per id in `sites`.
    pub fn workspace(&self, id: &str, kind: WorkspaceKind, sites: &[&str]) -> WorkspaceId {
        let workspace_id = WorkspaceId::new(id);
        self.directory.set_kind(&workspace_id, kind);
        for site in sites {
            self.add_site(&workspace_id, site);
        }
        workspace_id
    }

    pub fn add_site(&self, workspace_id: &WorkspaceId, site_id: &str) {
        self.directory
            .add_site(workspace_id, TargetSite::new(site_id, site_url(site_id)));
    }

    /// Move the clock to the earliest retry time in `reports`, if any.
    pub fn advance_to_retry(&self, reports: &[DispatchReport]) -> bool {
        match reports.iter().filter_map(|r| r.next_retry_at).min() {
            Some(at) => {
                self.clock.set(at.max(self.clock.now()));
                true
            }
            None => false,
        }
    }

    /// Dispatch and follow retries until nothing is scheduled, up to `rounds`.
    pub async fn drive(&self, rounds: usize) -> Vec<DispatchReport> {
        let mut all = Vec::new();
        for _ in 0..rounds {
            let reports = self
                .engine
                .run_dispatch_once()
                .await
                .expect("dispatch round");
            let scheduled = self.advance_to_retry(&reports);
            all.extend(reports);
            if !scheduled {
                break;
            }
        }
        all
    }
}

impl Default for EngineFixture {
    fn default() -> Self {
        Self::new()
    }
}
