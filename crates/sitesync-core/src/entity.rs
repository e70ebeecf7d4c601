//! Entity kinds, workspace kinds and entity snapshots.
//!
//! An entity snapshot is the view of a tenant row the engine works with: a
//! flat JSON object of field values plus the timestamps the reconciler needs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::WorkspaceId;

/// Field values of an entity, keyed by field name.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// Entity types that participate in site sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Post,
    Service,
    Booking,
    Settings,
}

impl EntityKind {
    /// Every supported entity kind.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Product,
        EntityKind::Post,
        EntityKind::Service,
        EntityKind::Booking,
        EntityKind::Settings,
    ];

    /// Wire name, used as the `entity_type` field and event type prefix.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Post => "post",
            EntityKind::Service => "service",
            EntityKind::Booking => "booking",
            EntityKind::Settings => "settings",
        }
    }

    /// Fields whose changes are propagated to deployed sites.
    ///
    /// Anything not listed here (view counters, internal audit columns) is
    /// ignored by change detection.
    pub const fn default_sync_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Product => &[
                "name",
                "slug",
                "description",
                "price",
                "compare_at_price",
                "sku",
                "stock_quantity",
                "is_active",
                "images",
                "category",
            ],
            EntityKind::Post => &[
                "title",
                "slug",
                "content",
                "excerpt",
                "status",
                "published_at",
                "featured_image",
                "tags",
            ],
            EntityKind::Service => &[
                "name",
                "description",
                "price",
                "duration_minutes",
                "is_active",
                "images",
            ],
            EntityKind::Booking => &[
                "service_id",
                "customer_name",
                "start_time",
                "end_time",
                "status",
            ],
            EntityKind::Settings => &[
                "site_name",
                "tagline",
                "logo",
                "theme",
                "primary_color",
                "contact_email",
                "social_links",
            ],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::unknown("entity kind", s))
    }
}

/// The kind of workspace, which decides which entity kinds are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    Store,
    Blog,
    Services,
}

impl WorkspaceKind {
    /// Entity kinds swept by the polling reconciler for this workspace kind.
    pub const fn entity_kinds(&self) -> &'static [EntityKind] {
        match self {
            WorkspaceKind::Store => &[EntityKind::Product, EntityKind::Settings],
            WorkspaceKind::Blog => &[EntityKind::Post, EntityKind::Settings],
            WorkspaceKind::Services => &[
                EntityKind::Service,
                EntityKind::Booking,
                EntityKind::Settings,
            ],
        }
    }
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Build the event type string, e.g. `product.updated`.
pub fn event_type(kind: EntityKind, change: ChangeKind) -> String {
    format!("{}.{}", kind.as_str(), change.as_str())
}

/// Current state of one entity as read from the tenant data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub workspace_id: WorkspaceId,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub fields: FieldMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-deleted rows are still returned so deletions can be reconciled.
    #[serde(default)]
    pub deleted: bool,
}

impl EntitySnapshot {
    /// Classify this snapshot relative to a sweep cursor.
    ///
    /// Rows created after the cursor are creations; soft-deleted rows are
    /// deletions; everything else is an update.
    pub fn change_since(&self, cursor: Option<DateTime<Utc>>) -> ChangeKind {
        if self.deleted {
            return ChangeKind::Deleted;
        }
        match cursor {
            Some(cursor) if self.created_at <= cursor => ChangeKind::Updated,
            _ => ChangeKind::Created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(created: i64, updated: i64, deleted: bool) -> EntitySnapshot {
        EntitySnapshot {
            workspace_id: WorkspaceId::from("ws"),
            entity_kind: EntityKind::Service,
            entity_id: "svc-1".into(),
            fields: FieldMap::new(),
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            updated_at: Utc.timestamp_opt(updated, 0).unwrap(),
            deleted,
        }
    }

    #[test]
    fn test_event_type_format() {
        assert_eq!(
            event_type(EntityKind::Product, ChangeKind::Updated),
            "product.updated"
        );
        assert_eq!(
            event_type(EntityKind::Service, ChangeKind::Created),
            "service.created"
        );
    }

    #[test]
    fn test_entity_kind_parse() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_change_since_cursor() {
        let cursor = Some(Utc.timestamp_opt(100, 0).unwrap());
        assert_eq!(snapshot(150, 150, false).change_since(cursor), ChangeKind::Created);
        assert_eq!(snapshot(50, 150, false).change_since(cursor), ChangeKind::Updated);
        assert_eq!(snapshot(50, 150, true).change_since(cursor), ChangeKind::Deleted);
        assert_eq!(snapshot(50, 150, false).change_since(None), ChangeKind::Created);
    }

    #[test]
    fn test_internal_fields_not_synced() {
        for kind in EntityKind::ALL {
            assert!(!kind.default_sync_fields().contains(&"last_viewed_at"));
        }
        assert!(EntityKind::Product.default_sync_fields().contains(&"price"));
    }
}
