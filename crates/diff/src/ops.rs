//! Structural ops diffs: the ordered list of field edits transforming one
//! document into another, and the digest used as an approval token.

use berth_core::{Path, PathSegment};
use md5::{Digest, Md5};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Add { path: Path, value: Value },
    Remove { path: Path, value: Value },
    Replace { path: Path, old: Value, new: Value },
}

/// Ordered field-level edits, emitted depth-first with mapping keys in
/// lexicographic order and sequences compared positionally. The ordering is
/// what makes `minimal_md5` a stable approval token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpsDiff {
    ops: Vec<FieldOp>,
}

impl OpsDiff {
    /// Diff transforming `existing` into `new`. Callers model a complete
    /// addition or removal by passing an empty mapping on one side.
    pub fn between(existing: &Value, new: &Value) -> OpsDiff {
        let mut ops = Vec::new();
        walk(existing, new, &Path::default(), &mut ops);
        OpsDiff { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[FieldOp] {
        &self.ops
    }

    /// Pretty-printed ops with stable ordering and no surrounding context.
    pub fn minimal_string(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            match op {
                FieldOp::Add { path, value } => {
                    out.push_str(&format!("add {}: {}\n", path, compact(value)))
                }
                FieldOp::Remove { path, value } => {
                    out.push_str(&format!("remove {}: {}\n", path, compact(value)))
                }
                FieldOp::Replace { path, old, new } => out.push_str(&format!(
                    "replace {}: {} -> {}\n",
                    path,
                    compact(old),
                    compact(new)
                )),
            }
        }
        out
    }

    /// Expanded rendering for debugging; values pretty-printed.
    pub fn full_string(&self) -> String {
        let mut out = format!("{} op(s)\n", self.ops.len());
        for op in &self.ops {
            match op {
                FieldOp::Add { path, value } => {
                    out.push_str(&format!("add {}:\n{}\n", path, pretty(value)))
                }
                FieldOp::Remove { path, value } => {
                    out.push_str(&format!("remove {}:\n{}\n", path, pretty(value)))
                }
                FieldOp::Replace { path, old, new } => out.push_str(&format!(
                    "replace {}:\n{}\n=>\n{}\n",
                    path,
                    pretty(old),
                    pretty(new)
                )),
            }
        }
        out
    }

    /// Canonical 128-bit digest of the minimal form, hex encoded.
    pub fn minimal_md5(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.minimal_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn compact(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "null".to_string())
}

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| "null".to_string())
}

fn walk(a: &Value, b: &Value, path: &Path, out: &mut Vec<FieldOp>) {
    match (a, b) {
        (Value::Object(ao), Value::Object(bo)) => {
            let keys: BTreeSet<&String> = ao.keys().chain(bo.keys()).collect();
            for k in keys {
                let child = path.join(PathSegment::Key(k.clone()));
                match (ao.get(k.as_str()), bo.get(k.as_str())) {
                    (Some(av), Some(bv)) => walk(av, bv, &child, out),
                    (Some(av), None) => out.push(FieldOp::Remove { path: child, value: av.clone() }),
                    (None, Some(bv)) => out.push(FieldOp::Add { path: child, value: bv.clone() }),
                    (None, None) => unreachable!(),
                }
            }
        }
        (Value::Array(aa), Value::Array(bb)) => {
            for i in 0..aa.len().max(bb.len()) {
                let child = path.join(PathSegment::Index(i));
                match (aa.get(i), bb.get(i)) {
                    (Some(av), Some(bv)) => walk(av, bv, &child, out),
                    (Some(av), None) => out.push(FieldOp::Remove { path: child, value: av.clone() }),
                    (None, Some(bv)) => out.push(FieldOp::Add { path: child, value: bv.clone() }),
                    (None, None) => unreachable!(),
                }
            }
        }
        _ => {
            if a != b {
                out.push(FieldOp::Replace {
                    path: path.clone(),
                    old: a.clone(),
                    new: b.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_documents_yield_empty_diff() {
        let v = json!({"a": 1, "b": [1, 2]});
        let d = OpsDiff::between(&v, &v);
        assert!(d.is_empty());
        assert_eq!(d.minimal_string(), "");
    }

    #[test]
    fn emits_ops_depth_first_keys_sorted() {
        let a = json!({"z": 1, "a": {"inner": 1}, "m": true});
        let b = json!({"a": {"inner": 2, "added": 3}, "m": true, "q": "new"});
        let d = OpsDiff::between(&a, &b);
        let s = d.minimal_string();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(
            lines,
            vec![
                "add a.added: 3",
                "replace a.inner: 1 -> 2",
                "add q: \"new\"",
                "remove z: 1",
            ]
        );
    }

    #[test]
    fn sequences_compare_positionally() {
        let a = json!({"ports": [{"port": 6380}, {"port": 9000}]});
        let b = json!({"ports": [{"port": 6381}]});
        let d = OpsDiff::between(&a, &b);
        let s = d.minimal_string();
        assert!(s.contains("replace ports[0].port: 6380 -> 6381"));
        assert!(s.contains("remove ports[1]: {\"port\":9000}"));
    }

    #[test]
    fn type_change_is_replace() {
        let a = json!({"x": {"m": 1}});
        let b = json!({"x": [1]});
        let d = OpsDiff::between(&a, &b);
        assert_eq!(d.len(), 1);
        assert!(matches!(d.ops()[0], FieldOp::Replace { .. }));
    }

    #[test]
    fn digest_is_stable_across_recomputation() {
        let a = json!({"spec": {"ports": [{"port": 6380}], "selector": {"app": "redis"}}});
        let b = json!({"spec": {"ports": [{"port": 6381}], "selector": {"app": "redis"}}});
        let d1 = OpsDiff::between(&a, &b);
        let d2 = OpsDiff::between(&a.clone(), &b.clone());
        assert_eq!(d1.minimal_md5(), d2.minimal_md5());
        assert_ne!(d1.minimal_md5(), OpsDiff::between(&a, &a).minimal_md5());
    }

    #[test]
    fn complete_addition_and_removal() {
        let v = json!({"apiVersion": "v1", "kind": "ConfigMap"});
        let add = OpsDiff::between(&json!({}), &v);
        assert_eq!(add.len(), 2);
        assert!(add.ops().iter().all(|op| matches!(op, FieldOp::Add { .. })));
        let rm = OpsDiff::between(&v, &json!({}));
        assert_eq!(rm.len(), 2);
        assert!(rm.ops().iter().all(|op| matches!(op, FieldOp::Remove { .. })));
    }
}
