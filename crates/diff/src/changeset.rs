//! Change set builder: pairs desired and existing resources by identity and
//! yields the unordered set of changes.

use std::collections::BTreeMap;

use berth_core::{Resource, ResourceId};

use crate::change::{Change, ChangeFactory};
use crate::DiffError;

#[derive(Debug, Clone)]
pub struct ChangeSetOpts {
    /// Ownership label (key, value); only existing resources bearing it are
    /// eligible for deletion when absent from the desired set.
    pub ownership_label: (String, String),
}

pub struct ChangeSet<'a> {
    existing: Vec<Resource>,
    new: Vec<Resource>,
    factory: &'a ChangeFactory,
    opts: ChangeSetOpts,
}

impl<'a> ChangeSet<'a> {
    pub fn new(
        existing: Vec<Resource>,
        new: Vec<Resource>,
        factory: &'a ChangeFactory,
        opts: ChangeSetOpts,
    ) -> ChangeSet<'a> {
        ChangeSet { existing, new, factory, opts }
    }

    /// One change per desired resource (paired or create), plus a delete per
    /// unpaired owned existing resource. Noop changes are retained; display
    /// filtering is the caller's concern since they still order dependents.
    pub fn calculate(&self) -> Result<Vec<Change>, DiffError> {
        let mut existing_by_id: BTreeMap<ResourceId, &Resource> =
            self.existing.iter().map(|r| (r.id(), r)).collect();

        let mut changes = Vec::with_capacity(self.new.len());
        for new_res in &self.new {
            let change = match existing_by_id.remove(&new_res.id()) {
                Some(existing) => self.factory.new_change(Some(existing), Some(new_res))?,
                None => self.factory.new_change(None, Some(new_res))?,
            };
            changes.push(change);
        }

        // Unpaired existing resources; map iteration keeps delete order
        // deterministic by identity.
        let (label_key, label_value) = &self.opts.ownership_label;
        for (_, existing) in existing_by_id {
            if existing.labels().get(label_key) != Some(label_value) {
                continue;
            }
            changes.push(self.factory.new_change(Some(existing), None)?);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOp;
    use berth_config::ConfigBundle;
    use serde_json::json;

    fn factory() -> ChangeFactory {
        ChangeFactory::new(ConfigBundle::default(), false)
    }

    fn opts() -> ChangeSetOpts {
        ChangeSetOpts {
            ownership_label: ("berth.dev/app".to_string(), "fp-1".to_string()),
        }
    }

    fn cm(name: &str, owned: bool, data: &str) -> Resource {
        let mut v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"k": data}
        });
        if owned {
            v["metadata"]["labels"] = json!({"berth.dev/app": "fp-1"});
        }
        Resource::from_value(v).unwrap()
    }

    #[test]
    fn pairs_by_identity_and_classifies_ops() {
        let f = factory();
        let existing = vec![cm("same", true, "v"), cm("changed", true, "old"), cm("gone", true, "v")];
        let new = vec![cm("same", true, "v"), cm("changed", true, "new"), cm("created", true, "v")];
        let changes = ChangeSet::new(existing, new, &f, opts()).calculate().unwrap();

        let op_of = |name: &str| {
            changes.iter().find(|c| c.resource().name() == name).map(|c| c.op()).unwrap()
        };
        assert_eq!(changes.len(), 4);
        assert_eq!(op_of("same"), ChangeOp::Noop);
        assert_eq!(op_of("changed"), ChangeOp::Update);
        assert_eq!(op_of("created"), ChangeOp::Create);
        assert_eq!(op_of("gone"), ChangeOp::Delete);
    }

    #[test]
    fn unowned_existing_resources_are_never_deleted() {
        let f = factory();
        let existing = vec![cm("not-ours", false, "v")];
        let changes = ChangeSet::new(existing, vec![], &f, opts()).calculate().unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn different_namespaces_do_not_pair() {
        let f = factory();
        let mut other_ns = cm("same", true, "v");
        other_ns.set_namespace("staging");
        let changes =
            ChangeSet::new(vec![other_ns], vec![cm("same", true, "v")], &f, opts())
                .calculate()
                .unwrap();
        assert_eq!(changes.len(), 2);
        let ops: Vec<ChangeOp> = changes.iter().map(|c| c.op()).collect();
        assert!(ops.contains(&ChangeOp::Create));
        assert!(ops.contains(&ChangeOp::Delete));
    }
}
