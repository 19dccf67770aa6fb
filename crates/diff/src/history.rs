//! Last-applied history embedded in resource annotations: recording the
//! applied snapshot plus its diff digest, and recovering it with tamper
//! checks.

use std::collections::BTreeMap;

use berth_core::{
    FieldRemoveMod, Path, Resource, StringMapAppendMod, MAX_ANNOTATIONS_BYTES,
};
use tracing::debug;

use crate::change::{Change, ChangeFactory};
use crate::DiffError;

pub const ORIGINAL_ANN_KEY: &str = "berth.dev/original";
pub const ORIGINAL_DIFF_ANN_KEY: &str = "berth.dev/original-diff";
pub const ORIGINAL_DIFF_MD5_ANN_KEY: &str = "berth.dev/original-diff-md5";
pub const ORIGINAL_DIFF_FULL_ANN_KEY: &str = "berth.dev/original-diff-full";

pub const HISTORY_ANN_KEYS: [&str; 4] = [
    ORIGINAL_ANN_KEY,
    ORIGINAL_DIFF_ANN_KEY,
    ORIGINAL_DIFF_MD5_ANN_KEY,
    ORIGINAL_DIFF_FULL_ANN_KEY,
];

/// Copy of the resource without the history annotations.
pub fn historyless(res: &Resource) -> Result<Resource, DiffError> {
    let mut out = res.deep_copy();
    for key in HISTORY_ANN_KEYS {
        let mod_ = FieldRemoveMod::all(annotation_path(key));
        mod_.apply(&mut out)?;
    }
    Ok(out)
}

fn annotation_path(key: &str) -> Path {
    Path::from_segments(vec![
        berth_core::PathSegment::Key("metadata".into()),
        berth_core::PathSegment::Key("annotations".into()),
        berth_core::PathSegment::Key(key.into()),
    ])
}

/// A live resource paired with the machinery to read and write its embedded
/// last-applied snapshot.
pub struct ResourceWithHistory<'a> {
    resource: Resource,
    factory: &'a ChangeFactory,
}

impl<'a> ResourceWithHistory<'a> {
    pub fn new(resource: &Resource, factory: &'a ChangeFactory) -> ResourceWithHistory<'a> {
        ResourceWithHistory { resource: resource.deep_copy(), factory }
    }

    /// Recovers the last applied desired resource, or nothing when the
    /// snapshot fails its digest check (stale or tampered with).
    ///
    /// The diff is recomputed two ways: exact, and with the configured
    /// diff-against-last-applied exclusions applied to the live resource.
    /// Earlier engine versions recorded with exclusions applied; snapshots
    /// written either way are accepted rather than falling back to diffing
    /// against the live resource, which would falsely re-apply racy fields.
    pub fn last_applied_resource(&self) -> Option<Resource> {
        let anns = self.resource.annotations();
        let original = anns.get(ORIGINAL_ANN_KEY)?;
        let expected_md5 = anns.get(ORIGINAL_DIFF_MD5_ANN_KEY)?;
        let candidate = Resource::from_compact_bytes(original.as_bytes()).ok()?;

        let exact = self.exact_historyless_change(&self.resource, &candidate).ok()?;
        let excluded = self.last_applied_change(&candidate).ok()?;

        for change in [exact, excluded] {
            let md5 = change.ops_diff().minimal_md5();
            let matches = md5 == *expected_md5;
            if self.factory.history_debug() {
                debug!(
                    resource = %self.resource.description(),
                    matches,
                    expected = %expected_md5,
                    recalculated = %md5,
                    "last-applied digest recalculation"
                );
            }
            if matches {
                return change.applied_resource().map(|r| r.deep_copy());
            }
        }
        None
    }

    /// Computes the four history annotations for `applied` and returns a copy
    /// of the resource carrying them. Oversized history degrades by dropping
    /// the debug annotations first; the compact snapshot itself must fit.
    pub fn record_last_applied(&self, applied: &Resource) -> Result<Resource, DiffError> {
        let change = self.last_applied_change(applied)?;
        let applied_res = change.applied_resource().ok_or(DiffError::InvalidChange)?;
        // Compact representation: annotation values share a 262,144 byte
        // budget per resource, enforced by the cluster.
        let applied_bytes = applied_res.as_compact_bytes()?;
        let diff = change.ops_diff();

        if self.factory.history_debug() {
            debug!(
                resource = %self.resource.description(),
                md5 = %diff.minimal_md5(),
                ops = diff.len(),
                "recording last-applied"
            );
        }

        let mut kvs = BTreeMap::from([
            (
                ORIGINAL_ANN_KEY.to_string(),
                String::from_utf8(applied_bytes).map_err(|e| {
                    DiffError::Core(berth_core::CoreError::InvalidResource(e.to_string()))
                })?,
            ),
            (ORIGINAL_DIFF_ANN_KEY.to_string(), diff.minimal_string()),
            (ORIGINAL_DIFF_MD5_ANN_KEY.to_string(), diff.minimal_md5()),
            (ORIGINAL_DIFF_FULL_ANN_KEY.to_string(), diff.full_string()),
        ]);

        let mut result = historyless(&self.resource)?;
        for dropped in [None, Some(ORIGINAL_DIFF_FULL_ANN_KEY), Some(ORIGINAL_DIFF_ANN_KEY)] {
            if let Some(key) = dropped {
                kvs.remove(key);
            }
            if annotations_bytes(&result, &kvs) <= MAX_ANNOTATIONS_BYTES {
                let append = StringMapAppendMod {
                    matchers: vec![berth_core::ResourceMatcher::All {}],
                    path: Path::from_keys(&["metadata", "annotations"]),
                    kvs: kvs.clone(),
                };
                append.apply(&mut result)?;
                return Ok(result);
            }
        }
        Err(DiffError::HistoryTooLarge {
            resource: self.resource.description(),
            bytes: annotations_bytes(&result, &kvs),
        })
    }

    // Diff base for recording: the live resource minus fields configured as
    // too racy to compare (they may be server-generated).
    fn last_applied_change(&self, applied: &Resource) -> Result<Change, DiffError> {
        let mut existing = self.resource.deep_copy();
        for excl in self.factory.diff_exclusions() {
            excl.apply(&mut existing)?;
        }
        self.exact_historyless_change(&existing, applied)
    }

    fn exact_historyless_change(
        &self,
        existing: &Resource,
        applied: &Resource,
    ) -> Result<Change, DiffError> {
        let existing = historyless(existing)?;
        let applied = historyless(applied)?;
        self.factory.new_exact_change(Some(&existing), Some(&applied))
    }
}

fn annotations_bytes(res: &Resource, pending: &BTreeMap<String, String>) -> usize {
    let mut total = 0;
    for (k, v) in res.annotations() {
        if !pending.contains_key(&k) {
            total += k.len() + v.len();
        }
    }
    for (k, v) in pending {
        total += k.len() + v.len();
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_config::ConfigBundle;
    use serde_json::json;

    fn factory() -> ChangeFactory {
        ChangeFactory::new(ConfigBundle::default(), false)
    }

    fn svc(port: u64) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "redis-master", "namespace": "default"},
            "spec": {"ports": [{"port": port}], "selector": {"app": "redis"}}
        }))
        .unwrap()
    }

    #[test]
    fn record_then_recover_round_trips() {
        let f = factory();
        let live = svc(6380);
        let applied = svc(6381);
        let recorded = ResourceWithHistory::new(&live, &f).record_last_applied(&applied).unwrap();

        let anns = recorded.annotations();
        assert!(anns.contains_key(ORIGINAL_ANN_KEY));
        assert!(anns.contains_key(ORIGINAL_DIFF_ANN_KEY));
        assert!(anns.contains_key(ORIGINAL_DIFF_MD5_ANN_KEY));
        assert!(anns.contains_key(ORIGINAL_DIFF_FULL_ANN_KEY));

        let recovered = ResourceWithHistory::new(&recorded, &f).last_applied_resource().unwrap();
        assert_eq!(recovered, historyless(&applied).unwrap());
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let f = factory();
        let live = svc(6380);
        let recorded = ResourceWithHistory::new(&live, &f).record_last_applied(&svc(6381)).unwrap();

        let mut tampered = recorded.deep_copy();
        let mut forged = svc(9999);
        forged = historyless(&forged).unwrap();
        tampered
            .set(
                &annotation_path(ORIGINAL_ANN_KEY),
                json!(String::from_utf8(forged.as_compact_bytes().unwrap()).unwrap()),
            )
            .unwrap();
        assert!(ResourceWithHistory::new(&tampered, &f).last_applied_resource().is_none());
    }

    #[test]
    fn accepts_snapshots_recorded_with_field_exclusions() {
        // Earlier engines recorded the diff with the exclusions applied to
        // the live resource; that digest must still be accepted.
        let f = factory();
        let mut live = svc(6380);
        live.set(&Path::from_keys(&["status"]), json!({"loadBalancer": {}})).unwrap();
        let applied = svc(6380);

        // Excluded-style digest: live minus [status] vs applied.
        let mut excluded_live = live.deep_copy();
        excluded_live.remove(&Path::from_keys(&["status"])).unwrap();
        let old_style = f
            .new_exact_change(Some(&excluded_live), Some(&applied))
            .unwrap()
            .ops_diff()
            .minimal_md5();

        let mut carrier = live.deep_copy();
        carrier
            .set(
                &annotation_path(ORIGINAL_ANN_KEY),
                json!(String::from_utf8(applied.as_compact_bytes().unwrap()).unwrap()),
            )
            .unwrap();
        carrier
            .set(&annotation_path(ORIGINAL_DIFF_MD5_ANN_KEY), json!(old_style))
            .unwrap();

        let recovered = ResourceWithHistory::new(&carrier, &f).last_applied_resource().unwrap();
        assert_eq!(recovered, applied);
    }

    #[test]
    fn missing_annotations_mean_no_recovery() {
        let f = factory();
        assert!(ResourceWithHistory::new(&svc(6380), &f).last_applied_resource().is_none());
    }

    #[test]
    fn oversized_history_drops_debug_annotations_first() {
        let f = factory();
        let live = svc(6380);
        let mut applied = svc(6380);
        applied
            .set(&Path::from_keys(&["data"]), json!("x".repeat(100_000)))
            .unwrap();
        let recorded = ResourceWithHistory::new(&live, &f).record_last_applied(&applied).unwrap();
        let anns = recorded.annotations();
        assert!(anns.contains_key(ORIGINAL_ANN_KEY));
        assert!(anns.contains_key(ORIGINAL_DIFF_MD5_ANN_KEY));
        assert!(!anns.contains_key(ORIGINAL_DIFF_FULL_ANN_KEY));
        assert!(anns.contains_key(ORIGINAL_DIFF_ANN_KEY));
    }

    #[test]
    fn history_that_cannot_fit_fails() {
        let f = factory();
        let live = svc(6380);
        let mut applied = svc(6380);
        applied
            .set(&Path::from_keys(&["data"]), json!("x".repeat(300_000)))
            .unwrap();
        let err =
            ResourceWithHistory::new(&live, &f).record_last_applied(&applied).unwrap_err();
        assert!(matches!(err, DiffError::HistoryTooLarge { .. }));
    }
}
