//! Changes: the reconciliation unit pairing an existing and a desired
//! resource with the ops diff between them.

use berth_config::ConfigBundle;
use berth_core::{FieldRemoveMod, Resource};
use serde_json::Value;

use crate::history::{historyless, ResourceWithHistory};
use crate::ops::OpsDiff;
use crate::rebase::rebase;
use crate::template::apply_template_rules;
use crate::DiffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
    Noop,
    Exists,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
            ChangeOp::Noop => "noop",
            ChangeOp::Exists => "exists",
        };
        write!(f, "{}", s)
    }
}

/// An immutable computed change. `applied_resource` is the document as it
/// will be sent to the cluster: desired plus rebased fields; the history
/// annotations are rewritten at apply time by the codec.
#[derive(Debug, Clone)]
pub struct Change {
    existing: Option<Resource>,
    new: Option<Resource>,
    applied: Option<Resource>,
    op: ChangeOp,
    ops_diff: OpsDiff,
}

impl Change {
    pub fn op(&self) -> ChangeOp {
        self.op
    }

    pub fn existing(&self) -> Option<&Resource> {
        self.existing.as_ref()
    }

    pub fn new_resource(&self) -> Option<&Resource> {
        self.new.as_ref()
    }

    pub fn applied_resource(&self) -> Option<&Resource> {
        self.applied.as_ref()
    }

    pub fn ops_diff(&self) -> &OpsDiff {
        &self.ops_diff
    }

    /// The resource this change is about, preferring the desired side.
    pub fn resource(&self) -> &Resource {
        self.new
            .as_ref()
            .or(self.existing.as_ref())
            .expect("change holds at least one resource")
    }

    pub fn id(&self) -> berth_core::ResourceId {
        self.resource().id()
    }

    pub fn description(&self) -> String {
        format!("{} {}", self.op, self.resource().description())
    }
}

/// Produces Changes for (existing, new) pairs, applying templating, rebase
/// and history-aware diff bases.
#[derive(Debug, Clone)]
pub struct ChangeFactory {
    bundle: ConfigBundle,
    history_debug: bool,
}

impl ChangeFactory {
    pub fn new(bundle: ConfigBundle, history_debug: bool) -> ChangeFactory {
        ChangeFactory { bundle, history_debug }
    }

    pub fn bundle(&self) -> &ConfigBundle {
        &self.bundle
    }

    pub(crate) fn diff_exclusions(&self) -> &[FieldRemoveMod] {
        &self.bundle.diff_exclusions
    }

    pub(crate) fn history_debug(&self) -> bool {
        self.history_debug
    }

    /// Full change computation: templating, rebase, then a diff between the
    /// recorded last-applied snapshot (when trustworthy) or the live
    /// resource, and the rebased desired state.
    pub fn new_change(
        &self,
        existing: Option<&Resource>,
        new: Option<&Resource>,
    ) -> Result<Change, DiffError> {
        match (existing, new) {
            (None, None) => Err(DiffError::InvalidChange),
            (None, Some(n)) => {
                let applied = historyless(&rebase(n, None, &self.bundle.rebase_rules)?)?;
                let op = if is_exists_marker(n) { ChangeOp::Exists } else { ChangeOp::Create };
                let ops_diff = match op {
                    ChangeOp::Exists => OpsDiff::default(),
                    _ => OpsDiff::between(&Value::Object(Default::default()), applied.as_value()),
                };
                Ok(Change {
                    existing: None,
                    new: Some(n.deep_copy()),
                    applied: Some(applied),
                    op,
                    ops_diff,
                })
            }
            (Some(e), None) => {
                let stripped = historyless(e)?;
                let ops_diff =
                    OpsDiff::between(stripped.as_value(), &Value::Object(Default::default()));
                Ok(Change {
                    existing: Some(e.deep_copy()),
                    new: None,
                    applied: None,
                    op: ChangeOp::Delete,
                    ops_diff,
                })
            }
            (Some(e), Some(n)) => {
                if is_exists_marker(n) {
                    return Ok(Change {
                        existing: Some(e.deep_copy()),
                        new: Some(n.deep_copy()),
                        applied: Some(historyless(n)?),
                        op: ChangeOp::Exists,
                        ops_diff: OpsDiff::default(),
                    });
                }
                let templated = apply_template_rules(n, e, &self.bundle.template_rules)?;
                let rebased = rebase(&templated, Some(e), &self.bundle.rebase_rules)?;
                let applied = historyless(&rebased)?;

                // Diff against the recorded last-applied snapshot when it
                // still checks out; otherwise fall back to the live resource
                // with the server-churn fields excluded, so a stale snapshot
                // doesn't turn every server write into a reported edit.
                let base = match ResourceWithHistory::new(e, self).last_applied_resource() {
                    Some(last_applied) => last_applied,
                    None => {
                        let mut b = historyless(e)?;
                        for excl in &self.bundle.diff_exclusions {
                            excl.apply(&mut b)?;
                        }
                        b
                    }
                };
                let ops_diff = OpsDiff::between(base.as_value(), applied.as_value());
                let op = if ops_diff.is_empty() { ChangeOp::Noop } else { ChangeOp::Update };
                Ok(Change {
                    existing: Some(e.deep_copy()),
                    new: Some(n.deep_copy()),
                    applied: Some(applied),
                    op,
                    ops_diff,
                })
            }
        }
    }

    /// Raw structural delta: no templating, no rebase, no history awareness.
    /// Used by the history codec, which must see exactly what changed.
    pub fn new_exact_change(
        &self,
        existing: Option<&Resource>,
        new: Option<&Resource>,
    ) -> Result<Change, DiffError> {
        let empty = Value::Object(Default::default());
        let (a, b) = match (existing, new) {
            (None, None) => return Err(DiffError::InvalidChange),
            (a, b) => (a, b),
        };
        let a_val = a.map(|r| r.as_value().clone()).unwrap_or_else(|| empty.clone());
        let b_val = b.map(|r| r.as_value().clone()).unwrap_or(empty);
        let ops_diff = OpsDiff::between(&a_val, &b_val);
        let op = match (a, b) {
            (None, Some(_)) => ChangeOp::Create,
            (Some(_), None) => ChangeOp::Delete,
            _ if ops_diff.is_empty() => ChangeOp::Noop,
            _ => ChangeOp::Update,
        };
        Ok(Change {
            existing: existing.map(|r| r.deep_copy()),
            new: new.map(|r| r.deep_copy()),
            applied: new.map(|r| r.deep_copy()),
            op,
            ops_diff,
        })
    }
}

fn is_exists_marker(res: &Resource) -> bool {
    res.annotations().contains_key(berth_core::EXISTS_ANN_KEY)
}
