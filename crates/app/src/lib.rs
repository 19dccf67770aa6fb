//! Application records: a ConfigMap per named application carrying the
//! ownership fingerprint, a bounded ring of change records around each
//! reconcile, and desired-resource preparation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use berth_cluster::{ClusterClient, ClusterError, DeletePropagation, Selector, UpdateStrategy};
use berth_core::{CoreError, Path, Resource, ResourceId, IS_APP_LABEL_KEY, OWNERSHIP_LABEL_KEY};

/// Label on change-record ConfigMaps tying them to their application.
pub const APP_CHANGE_LABEL_KEY: &str = "berth.dev/app-change";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("trying to apply an empty set of resources, which would delete every resource the application owns; refusing to continue unless --dangerous-allow-empty-set is specified")]
    EmptyDesiredSet,
    #[error("application '{0}' not found")]
    NotFound(String),
    #[error("invalid application record: {0}")]
    InvalidRecord(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMeta {
    pub label_key: String,
    pub label_value: String,
}

impl AppMeta {
    pub fn selector(&self) -> Selector {
        Selector { key: self.label_key.clone(), value: self.label_value.clone() }
    }
}

/// Per-reconcile provenance, persisted in its own ConfigMap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub description: String,
    pub namespaces: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub successful: Option<bool>,
}

pub struct App {
    name: String,
    namespace: String,
    client: Arc<dyn ClusterClient>,
}

impl App {
    pub fn new(name: &str, namespace: &str, client: Arc<dyn ClusterClient>) -> App {
        App { name: name.to_string(), namespace: namespace.to_string(), client }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn record_id(&self) -> ResourceId {
        ResourceId {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: Some(self.namespace.clone()),
            name: self.name.clone(),
        }
    }

    pub async fn exists(&self) -> Result<bool, AppError> {
        match self.client.get(&self.record_id()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn meta(&self) -> Result<AppMeta, AppError> {
        let res = match self.client.get(&self.record_id()).await {
            Ok(res) => res,
            Err(e) if e.is_not_found() => return Err(AppError::NotFound(self.name.clone())),
            Err(e) => return Err(e.into()),
        };
        Self::meta_from_record(&res)
    }

    fn meta_from_record(res: &Resource) -> Result<AppMeta, AppError> {
        let spec = res
            .get(&Path::from_keys(&["data", "spec"]))
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidRecord("missing data.spec".to_string()))?;
        serde_json::from_str(spec).map_err(|e| AppError::InvalidRecord(e.to_string()))
    }

    /// Creates the application record if absent; existing records keep their
    /// fingerprint so ownership labels stay stable across reconciles.
    pub async fn create_or_update(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<AppMeta, AppError> {
        match self.client.get(&self.record_id()).await {
            Ok(existing) => Self::meta_from_record(&existing),
            Err(e) if e.is_not_found() => {
                let meta = AppMeta {
                    label_key: OWNERSHIP_LABEL_KEY.to_string(),
                    label_value: format!("berth-{}", Uuid::new_v4().simple()),
                };
                let mut record_labels = labels.clone();
                record_labels.insert(IS_APP_LABEL_KEY.to_string(), String::new());
                let record = Resource::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {
                        "name": self.name,
                        "namespace": self.namespace,
                        "labels": record_labels,
                    },
                    "data": {
                        "spec": serde_json::to_string(&meta)
                            .map_err(|e| AppError::InvalidRecord(e.to_string()))?,
                    }
                }))?;
                self.client.create(&record).await?;
                debug!(app = %self.name, fingerprint = %meta.label_value, "application record created");
                Ok(meta)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self) -> Result<(), AppError> {
        match self.client.delete(&self.record_id(), DeletePropagation::Background).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn change_selector(&self) -> Selector {
        Selector { key: APP_CHANGE_LABEL_KEY.to_string(), value: self.name.clone() }
    }

    /// Opens a change record; the returned handle settles it.
    pub async fn begin_change(&self, record: ChangeRecord) -> Result<ChangeHandle, AppError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = ResourceId {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: Some(self.namespace.clone()),
            name: format!("{}-change-{}", self.name, &suffix[..10]),
        };
        let res = change_resource(&id, &self.name, &record)?;
        self.client.create(&res).await?;
        Ok(ChangeHandle { client: self.client.clone(), id, record })
    }

    /// All recorded changes, oldest first.
    pub async fn changes(&self) -> Result<Vec<(ResourceId, ChangeRecord)>, AppError> {
        let mut out = Vec::new();
        for res in self.client.list(&self.change_selector()).await? {
            let spec = res
                .get(&Path::from_keys(&["data", "spec"]))
                .and_then(|v| v.as_str())
                .ok_or_else(|| AppError::InvalidRecord("missing data.spec".to_string()))?;
            let record: ChangeRecord =
                serde_json::from_str(spec).map_err(|e| AppError::InvalidRecord(e.to_string()))?;
            out.push((res.id(), record));
        }
        out.sort_by(|a, b| a.1.started_at.cmp(&b.1.started_at));
        Ok(out)
    }

    /// Deletes the oldest changes beyond `max`, returning (kept, deleted).
    /// The review callback sees the doomed records before anything is removed.
    pub async fn gc_changes(
        &self,
        max: usize,
        review: Option<&(dyn Fn(&[ChangeRecord]) -> Result<(), AppError> + Send + Sync)>,
    ) -> Result<(usize, usize), AppError> {
        let all = self.changes().await?;
        if all.len() <= max {
            return Ok((all.len(), 0));
        }
        let doomed = &all[..all.len() - max];
        if let Some(review) = review {
            review(&doomed.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>())?;
        }
        for (id, _) in doomed {
            match self.client.delete(id, DeletePropagation::Background).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok((max, doomed.len()))
    }
}

/// Settles an open change record. Settling is bookkeeping: callers report
/// the reconcile outcome from the apply itself and treat errors here as
/// best-effort, so a failed record write never masks a successful apply.
pub struct ChangeHandle {
    client: Arc<dyn ClusterClient>,
    id: ResourceId,
    record: ChangeRecord,
}

impl ChangeHandle {
    pub async fn succeed(self) -> Result<(), AppError> {
        self.settle(true).await
    }

    pub async fn fail(self) -> Result<(), AppError> {
        self.settle(false).await
    }

    async fn settle(mut self, successful: bool) -> Result<(), AppError> {
        self.record.finished_at = Some(Utc::now());
        self.record.successful = Some(successful);
        let app_name = self
            .id
            .name
            .rsplit_once("-change-")
            .map(|(app, _)| app.to_string())
            .unwrap_or_default();
        let res = change_resource(&self.id, &app_name, &self.record)?;
        self.client.update(&res, UpdateStrategy::JsonMergePatch).await?;
        Ok(())
    }
}

fn change_resource(
    id: &ResourceId,
    app_name: &str,
    record: &ChangeRecord,
) -> Result<Resource, AppError> {
    Ok(Resource::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": id.name,
            "namespace": id.namespace,
            "labels": {APP_CHANGE_LABEL_KEY: app_name},
        },
        "data": {
            "spec": serde_json::to_string(record)
                .map_err(|e| AppError::InvalidRecord(e.to_string()))?,
        }
    }))?)
}

/// Refuses to reconcile an empty desired set: with nothing desired, every
/// owned resource would be deleted.
pub fn validate_desired(new: &[Resource], allow_empty: bool) -> Result<(), AppError> {
    if new.is_empty() && !allow_empty {
        return Err(AppError::EmptyDesiredSet);
    }
    Ok(())
}

const CLUSTER_SCOPED_KINDS: [&str; 9] = [
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "Node",
    "APIService",
];

/// Fills in the default namespace on namespaced resources that lack one.
pub fn prepare_resources(
    mut resources: Vec<Resource>,
    default_namespace: Option<&str>,
) -> Vec<Resource> {
    if let Some(ns) = default_namespace {
        for res in &mut resources {
            if res.namespace().is_none() && !CLUSTER_SCOPED_KINDS.contains(&res.kind()) {
                res.set_namespace(ns);
            }
        }
    }
    resources
}

/// Stamps the ownership label (and any configured additional labels) onto
/// every desired resource; the ownership label is what the builder later uses
/// to enumerate live resources belonging to the application.
pub fn apply_ownership_labels(
    resources: &mut [Resource],
    meta: &AppMeta,
    additional: &BTreeMap<String, String>,
) -> Result<(), AppError> {
    for res in resources.iter_mut() {
        let mut kvs = additional.clone();
        kvs.insert(meta.label_key.clone(), meta.label_value.clone());
        let append = berth_core::StringMapAppendMod {
            matchers: vec![berth_core::ResourceMatcher::All {}],
            path: Path::from_keys(&["metadata", "labels"]),
            kvs,
        };
        append.apply(res)?;
    }
    Ok(())
}

/// Drops application records from a live listing; they are bookkeeping, not
/// ordinary cluster resources.
pub fn without_app_records(existing: Vec<Resource>) -> Vec<Resource> {
    existing
        .into_iter()
        .filter(|r| {
            !r.labels().contains_key(IS_APP_LABEL_KEY)
                && !r.labels().contains_key(APP_CHANGE_LABEL_KEY)
        })
        .collect()
}
