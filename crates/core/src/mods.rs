//! Structural modifications applied to resources: field removal, field copy
//! between documents, and string-map appends (labels, annotations).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{CoreError, Path, Resource};

/// Declarative matcher deciding whether a mod applies to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceMatcher {
    #[serde(rename = "allResourceMatcher")]
    All {},
    #[serde(rename = "apiVersionKindMatcher", rename_all = "camelCase")]
    ApiVersionKind { api_version: String, kind: String },
    #[serde(rename = "kindNamespaceNameMatcher", rename_all = "camelCase")]
    KindNamespaceName { kind: String, namespace: String, name: String },
}

impl ResourceMatcher {
    pub fn matches(&self, res: &Resource) -> bool {
        match self {
            ResourceMatcher::All {} => true,
            ResourceMatcher::ApiVersionKind { api_version, kind } => {
                res.id().api_version() == *api_version && res.kind() == kind
            }
            ResourceMatcher::KindNamespaceName { kind, namespace, name } => {
                res.kind() == kind
                    && res.namespace() == Some(namespace.as_str())
                    && res.name() == name
            }
        }
    }
}

/// Whether any matcher in the list accepts the resource. An empty list
/// matches nothing.
pub fn any_matches(matchers: &[ResourceMatcher], res: &Resource) -> bool {
    matchers.iter().any(|m| m.matches(res))
}

/// Removes the field at `path` from matching resources.
#[derive(Debug, Clone)]
pub struct FieldRemoveMod {
    pub matchers: Vec<ResourceMatcher>,
    pub path: Path,
}

impl FieldRemoveMod {
    pub fn all(path: Path) -> FieldRemoveMod {
        FieldRemoveMod { matchers: vec![ResourceMatcher::All {}], path }
    }

    pub fn apply(&self, res: &mut Resource) -> Result<(), CoreError> {
        if any_matches(&self.matchers, res) {
            res.remove(&self.path)?;
        }
        Ok(())
    }
}

/// Which document a copy reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopySource {
    New,
    Existing,
}

/// Copies the field at `path` into matching resources, reading the first
/// source (in declaration order) that has the field present.
#[derive(Debug, Clone)]
pub struct FieldCopyMod {
    pub matchers: Vec<ResourceMatcher>,
    pub path: Path,
    pub sources: Vec<CopySource>,
}

impl FieldCopyMod {
    /// Applies against a (new, existing) pair; `target` starts as a copy of
    /// the new resource. Absent sources fall through to the next.
    pub fn apply(
        &self,
        target: &mut Resource,
        new: &Resource,
        existing: Option<&Resource>,
    ) -> Result<(), CoreError> {
        if !any_matches(&self.matchers, target) {
            return Ok(());
        }
        for source in &self.sources {
            let src = match source {
                CopySource::New => new,
                CopySource::Existing => match existing {
                    Some(res) => res,
                    None => continue,
                },
            };
            if target.copy_from(src, &self.path)? {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Appends entries to a string map (labels or annotations) on matching
/// resources, creating the map when absent.
#[derive(Debug, Clone)]
pub struct StringMapAppendMod {
    pub matchers: Vec<ResourceMatcher>,
    pub path: Path,
    pub kvs: BTreeMap<String, String>,
}

impl StringMapAppendMod {
    pub fn apply(&self, res: &mut Resource) -> Result<(), CoreError> {
        if !any_matches(&self.matchers, res) {
            return Ok(());
        }
        for (k, v) in &self.kvs {
            let mut path = self.path.clone();
            path.push(crate::PathSegment::Key(k.clone()));
            res.set(&path, Value::String(v.clone()))?;
        }
        Ok(())
    }
}
