//! Berth core types: cluster documents, field paths, structural mods.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod mods;
pub mod path;

pub use mods::{FieldCopyMod, FieldRemoveMod, ResourceMatcher, StringMapAppendMod};
pub use path::{Path, PathSegment};

/// Reserved label marking a resource as belonging to a named application.
pub const OWNERSHIP_LABEL_KEY: &str = "berth.dev/app";
/// Reserved label marking application records themselves.
pub const IS_APP_LABEL_KEY: &str = "berth.dev/is-app";
/// Annotation marking a desired document as presence-only (op Exists).
pub const EXISTS_ANN_KEY: &str = "berth.dev/exists";

/// Combined byte budget for all annotations on one resource (cluster-enforced).
pub const MAX_ANNOTATIONS_BYTES: usize = 262_144;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Identity tuple used as the change-set pairing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {} (ns: {})", self.api_version(), self.kind, self.name, ns),
            None => write!(f, "{}/{} {} (cluster)", self.api_version(), self.kind, self.name),
        }
    }
}

/// A cluster document: a nested mapping of fields keyed by
/// `(group, version, kind, namespace, name)`.
///
/// Backed by a `serde_json::Value` whose maps iterate in key order, which is
/// what makes compact serialization and diff walks deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    value: Value,
}

impl Resource {
    /// Wraps a parsed document, validating the identity fields are present.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        if !value.is_object() {
            return Err(CoreError::InvalidResource("document is not a mapping".into()));
        }
        let res = Resource { value };
        if res.api_version_str().is_none() {
            return Err(CoreError::InvalidResource("missing apiVersion".into()));
        }
        if res.str_at(&["kind"]).is_none() {
            return Err(CoreError::InvalidResource("missing kind".into()));
        }
        if res.str_at(&["metadata", "name"]).is_none() {
            return Err(CoreError::InvalidResource("missing metadata.name".into()));
        }
        Ok(res)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    fn str_at(&self, keys: &[&str]) -> Option<&str> {
        let mut cur = &self.value;
        for k in keys {
            cur = cur.get(k)?;
        }
        cur.as_str()
    }

    fn api_version_str(&self) -> Option<&str> {
        self.str_at(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"]).unwrap_or("")
    }

    pub fn group(&self) -> &str {
        match self.api_version_str().unwrap_or("") {
            av if av.contains('/') => av.split('/').next().unwrap_or(""),
            _ => "",
        }
    }

    pub fn version(&self) -> &str {
        let av = self.api_version_str().unwrap_or("");
        match av.split_once('/') {
            Some((_, v)) => v,
            None => av,
        }
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"]).unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn set_namespace(&mut self, ns: &str) {
        let _ = self.set(
            &Path::from_keys(&["metadata", "namespace"]),
            Value::String(ns.to_string()),
        );
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_at(&["metadata", "uid"])
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.str_at(&["metadata", "resourceVersion"])
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            group: self.group().to_string(),
            version: self.version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().map(|s| s.to_string()),
            name: self.name().to_string(),
        }
    }

    /// Short human description used in messages and logs.
    pub fn description(&self) -> String {
        self.id().to_string()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map(&["metadata", "labels"])
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map(&["metadata", "annotations"])
    }

    fn string_map(&self, keys: &[&str]) -> BTreeMap<String, String> {
        let mut cur = &self.value;
        for k in keys {
            match cur.get(k) {
                Some(v) => cur = v,
                None => return BTreeMap::new(),
            }
        }
        match cur.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            None => BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<&Value> {
        path::get_at(&self.value, path.segments())
    }

    /// All values matched by `path`, expanding wildcard segments.
    pub fn collect(&self, path: &Path) -> Vec<&Value> {
        path::collect_at(&self.value, path.segments())
    }

    /// Writes `new` at `path`, creating intermediate mappings for key
    /// segments. A write through a wildcard applies to each match.
    pub fn set(&mut self, path: &Path, new: Value) -> Result<(), CoreError> {
        path::set_at(&mut self.value, path.segments(), &new).map_err(|reason| {
            CoreError::InvalidPath { path: path.to_string(), reason }
        })
    }

    /// Removes the field at `path`. Returns whether anything was removed.
    pub fn remove(&mut self, path: &Path) -> Result<bool, CoreError> {
        path::remove_at(&mut self.value, path.segments()).map_err(|reason| {
            CoreError::InvalidPath { path: path.to_string(), reason }
        })
    }

    /// Copies the field at `path` from `src` into self, index by index for
    /// wildcard segments. Absent source fields are left untouched.
    pub fn copy_from(&mut self, src: &Resource, path: &Path) -> Result<bool, CoreError> {
        path::copy_at(&mut self.value, &src.value, path.segments()).map_err(|reason| {
            CoreError::InvalidPath { path: path.to_string(), reason }
        })
    }

    pub fn deep_copy(&self) -> Resource {
        self.clone()
    }

    /// Canonical serialization: keys sorted, no insignificant whitespace.
    pub fn as_compact_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(&self.value)
            .map_err(|e| CoreError::InvalidResource(format!("serializing: {}", e)))
    }

    pub fn from_compact_bytes(bytes: &[u8]) -> Result<Resource, CoreError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::InvalidResource(format!("deserializing: {}", e)))?;
        Resource::from_value(value)
    }
}
