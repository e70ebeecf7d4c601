//! Change detection: deciding whether a mutation is sync-worthy.
//!
//! Detection compares the previous and current field values of an entity
//! against the allowlist of sync-relevant fields for its kind. Only
//! allowlisted fields are ever compared or shipped to sites.
//!
//! A missing previous snapshot is never a reason to skip: every allowlisted
//! field is then reported as changed.

use serde::{Deserialize, Serialize};

use crate::entity::{ChangeKind, FieldMap};

/// Outcome of comparing two snapshots of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// What happened to the entity.
    pub change: ChangeKind,
    /// Allowlisted fields that differ, in allowlist order.
    pub changed_fields: Vec<String>,
}

impl ChangeSet {
    /// Whether this change must be propagated to deployed sites.
    pub fn is_sync_worthy(&self) -> bool {
        match self.change {
            ChangeKind::Created | ChangeKind::Deleted => true,
            ChangeKind::Updated => !self.changed_fields.is_empty(),
        }
    }
}

/// Compute the allowlisted fields that changed between `previous` and `current`.
pub fn detect_changes<F: AsRef<str>>(
    allowlist: &[F],
    change: ChangeKind,
    previous: Option<&FieldMap>,
    current: &FieldMap,
) -> ChangeSet {
    let changed_fields = match (change, previous) {
        (ChangeKind::Updated, Some(previous)) => allowlist
            .iter()
            .map(AsRef::as_ref)
            .filter(|field| previous.get(*field) != current.get(*field))
            .map(str::to_string)
            .collect(),
        (ChangeKind::Updated, None) => allowlist
            .iter()
            .map(|field| field.as_ref().to_string())
            .collect(),
        (ChangeKind::Created | ChangeKind::Deleted, _) => allowlist
            .iter()
            .map(AsRef::as_ref)
            .filter(|field| current.contains_key(*field))
            .map(str::to_string)
            .collect(),
    };

    ChangeSet {
        change,
        changed_fields,
    }
}

/// Restrict a snapshot to its allowlisted fields.
///
/// The result is the `data` object delivered to sites.
pub fn project_payload<F: AsRef<str>>(allowlist: &[F], current: &FieldMap) -> FieldMap {
    allowlist
        .iter()
        .filter_map(|field| {
            current
                .get_key_value(field.as_ref())
                .map(|(key, value)| (key.clone(), value.clone()))
        })
        .collect()
}
