//! Proptest generators for property-based testing.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value;

use sitesync_core::{ChangeKind, EntityKind, FieldMap, RetryPolicy, SiteId};

/// Generate an entity kind.
pub fn entity_kind() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Generate a change kind.
pub fn change_kind() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Created),
        Just(ChangeKind::Updated),
        Just(ChangeKind::Deleted),
    ]
}

/// Generate a scalar JSON value of the kind entity rows carry.
pub fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 .-]{0,24}".prop_map(Value::String),
    ]
}

/// Generate a field name outside every allowlist.
pub fn internal_field() -> impl Strategy<Value = String> {
    "internal_[a-z]{1,8}".prop_map(String::from)
}

/// Generate a row for `kind`: some synced fields plus some internal ones.
pub fn entity_fields(kind: EntityKind) -> impl Strategy<Value = FieldMap> {
    let synced: Vec<String> = kind
        .default_sync_fields()
        .iter()
        .map(|f| f.to_string())
        .collect();
    (
        prop::sample::subsequence(synced.clone(), 0..=synced.len()),
        prop::collection::vec(field_value(), synced.len()),
        prop::collection::btree_map(internal_field(), field_value(), 0..4),
    )
        .prop_map(|(names, values, internal)| {
            let mut map: FieldMap = names.into_iter().zip(values).collect();
            map.extend(internal);
            map
        })
}

/// Generate a non-empty set of site ids.
pub fn site_ids(max: usize) -> impl Strategy<Value = BTreeSet<SiteId>> {
    prop::collection::btree_set("site-[a-z0-9]{1,6}".prop_map(SiteId::new), 1..=max.max(1))
}

/// Generate a retry policy with a small budget and non-decreasing
/// millisecond delays.
pub fn retry_policy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..=8, prop::collection::vec(0u64..=500, 1..=8), 0u32..=3).prop_map(
        |(max_retries, mut delays, connect_retries)| {
            delays.sort_unstable();
            RetryPolicy {
                max_retries,
                base_delays: delays.into_iter().map(Duration::from_millis).collect(),
                connect_retries,
                connect_retry_base: Duration::ZERO,
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::{detect_changes, project_payload};

    proptest! {
        #[test]
        fn test_projection_keeps_only_synced_fields(
            (kind, row) in entity_kind().prop_flat_map(|kind| (Just(kind), entity_fields(kind)))
        ) {
            let allowlist = kind.default_sync_fields();
            let payload = project_payload(allowlist, &row);
            prop_assert!(payload.keys().all(|k| allowlist.contains(&k.as_str())));
            prop_assert!(payload.keys().all(|k| row.get(k) == payload.get(k)));
        }

        #[test]
        fn test_identical_update_is_never_sync_worthy(
            (kind, row) in entity_kind().prop_flat_map(|kind| (Just(kind), entity_fields(kind)))
        ) {
            let set = detect_changes(kind.default_sync_fields(), ChangeKind::Updated, Some(&row), &row);
            prop_assert!(!set.is_sync_worthy());
        }

        #[test]
        fn test_retry_delays_stay_under_base(policy in retry_policy(), attempt in 1u32..=10) {
            let mut rng = rand::thread_rng();
            prop_assert!(policy.delay(attempt, &mut rng) <= policy.base_delay(attempt));
        }
    }
}
