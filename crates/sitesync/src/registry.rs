//! Entity sources.
//!
//! The engine never reads tenant tables directly. Each syncable entity kind
//! is exposed through a [`SyncableEntity`] registered in an
//! [`EntityRegistry`]; the registry also owns the per-kind field allowlists
//! the change detector diffs against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sitesync_core::{EntityKind, EntitySnapshot, WorkspaceId};
use thiserror::Error;

/// Failure reported by an entity source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity source error: {0}")]
pub struct EntityError(pub String);

/// Read access to one entity kind in the tenant data store.
#[async_trait]
pub trait SyncableEntity: Send + Sync {
    fn entity_kind(&self) -> EntityKind;

    /// Fields whose changes are worth a sync. Defaults to the kind's allowlist.
    fn sync_fields(&self) -> Vec<String> {
        self.entity_kind()
            .default_sync_fields()
            .iter()
            .map(|f| f.to_string())
            .collect()
    }

    /// Current state of one entity.
    async fn snapshot(
        &self,
        workspace_id: &WorkspaceId,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, EntityError>;

    /// Entities modified after `since` (all of them if `None`), including
    /// soft-deleted ones.
    async fn modified_since(
        &self,
        workspace_id: &WorkspaceId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntitySnapshot>, EntityError>;
}

/// Entity sources keyed by kind.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    sources: HashMap<EntityKind, Arc<dyn SyncableEntity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any previous one for the same kind.
    pub fn register(&mut self, source: Arc<dyn SyncableEntity>) {
        self.sources.insert(source.entity_kind(), source);
    }

    pub fn with(mut self, source: Arc<dyn SyncableEntity>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, kind: EntityKind) -> Option<&Arc<dyn SyncableEntity>> {
        self.sources.get(&kind)
    }

    /// Allowlist for `kind`: the registered source's, else the built-in default.
    pub fn allowlist(&self, kind: EntityKind) -> Vec<String> {
        match self.sources.get(&kind) {
            Some(source) => source.sync_fields(),
            None => kind
                .default_sync_fields()
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = self.sources.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
