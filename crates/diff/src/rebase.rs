//! Rebase: transplants selected fields from the live resource onto a copy of
//! the desired one, so server-owned values don't read as user edits.

use berth_config::{RebaseOp, RebaseRule};
use berth_core::mods::FieldCopyMod;
use berth_core::Resource;

use crate::history::HISTORY_ANN_KEYS;
use crate::DiffError;

/// Applies rebase rules in declaration order; later rules see earlier rules'
/// writes. Pure: reads nothing beyond the two arguments.
pub fn rebase(
    new: &Resource,
    existing: Option<&Resource>,
    rules: &[RebaseRule],
) -> Result<Resource, DiffError> {
    let mut target = new.deep_copy();
    for rule in rules {
        if !rule.matches(&target) {
            continue;
        }
        for path in &rule.paths {
            match rule.op {
                RebaseOp::Copy => {
                    let copy = FieldCopyMod {
                        matchers: rule.matchers.clone(),
                        path: path.clone(),
                        sources: rule.sources.clone(),
                    };
                    copy.apply(&mut target, new, existing).map_err(|e| {
                        DiffError::RebaseFailed { resource: new.description(), source: e }
                    })?;
                }
                RebaseOp::Remove => {
                    target.remove(path).map_err(|e| DiffError::RebaseFailed {
                        resource: new.description(),
                        source: e,
                    })?;
                }
            }
        }
    }
    preserve_reserved_annotations(&mut target, existing)?;
    Ok(target)
}

// Unknown annotations under the reserved prefix are opaque: carried over from
// the live resource unless the desired document overrides them. The history
// annotations are managed by the codec and never flow through rebase.
fn preserve_reserved_annotations(
    target: &mut Resource,
    existing: Option<&Resource>,
) -> Result<(), DiffError> {
    let existing = match existing {
        Some(res) => res,
        None => return Ok(()),
    };
    let target_anns = target.annotations();
    for (k, v) in existing.annotations() {
        if !k.starts_with("berth.dev/") {
            continue;
        }
        if HISTORY_ANN_KEYS.contains(&k.as_str()) {
            continue;
        }
        if target_anns.contains_key(&k) {
            continue;
        }
        let path = berth_core::Path::from_segments(vec![
            berth_core::PathSegment::Key("metadata".into()),
            berth_core::PathSegment::Key("annotations".into()),
            berth_core::PathSegment::Key(k),
        ]);
        target.set(&path, serde_json::Value::String(v))?;
    }
    Ok(())
}
