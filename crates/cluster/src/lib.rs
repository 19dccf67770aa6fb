//! Cluster access: classified errors, the `ClusterClient` contract, and the
//! kube-backed implementation with discovery caching.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{verbs, Discovery, Scope};
use kube::Client;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use berth_core::{Resource, ResourceId};

/// Classified cluster errors; every variant names the offending resource.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{resource}: please apply your changes to the latest version and try again (reason: {reason})")]
    Conflict { resource: String, reason: String },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{resource}: forbidden: {message}")]
    Forbidden { resource: String, message: String },
    #[error("{resource}: invalid: {message}")]
    Invalid { resource: String, message: String },
    #[error("{resource}: server timeout: {message}")]
    ServerTimeout { resource: String, message: String },
    #[error("{resource}: {message}")]
    Other { resource: String, message: String },
}

impl ClusterError {
    pub fn classify(resource: &str, err: kube::Error) -> ClusterError {
        match err {
            kube::Error::Api(ae) => {
                let resource = resource.to_string();
                match (ae.code, ae.reason.as_str()) {
                    (404, _) => ClusterError::NotFound(resource),
                    (409, "AlreadyExists") => ClusterError::AlreadyExists(resource),
                    (409, reason) => ClusterError::Conflict { resource, reason: reason.to_string() },
                    (403, _) => ClusterError::Forbidden { resource, message: ae.message },
                    (422, _) => ClusterError::Invalid { resource, message: ae.message },
                    (504, _) => ClusterError::ServerTimeout { resource, message: ae.message },
                    _ => ClusterError::Other { resource, message: ae.message },
                }
            }
            other => ClusterError::Other {
                resource: resource.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    StrategicMergePatch,
    JsonMergePatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
    Foreground,
    Background,
    Orphan,
}

/// Label selector enumerating an application's live resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

impl Selector {
    pub fn as_label_query(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// CRUD against the cluster, with errors classified per `ClusterError`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Resource, ClusterError>;
    async fn create(&self, res: &Resource) -> Result<Resource, ClusterError>;
    async fn update(&self, res: &Resource, strategy: UpdateStrategy)
        -> Result<Resource, ClusterError>;
    async fn delete(&self, id: &ResourceId, propagation: DeletePropagation)
        -> Result<(), ClusterError>;
    /// All live resources matching the selector, across every listable kind.
    async fn list(&self, selector: &Selector) -> Result<Vec<Resource>, ClusterError>;
}

// Discovery cache: GVK key -> (ApiResource, namespaced). Discovery runs are
// expensive; lookups after the first resolve from here.
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (kube::core::ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn gvk_cache_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// kube-rs backed client.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub async fn try_default() -> anyhow::Result<KubeClusterClient> {
        let client = Client::try_default().await?;
        Ok(KubeClusterClient { client })
    }

    pub fn new(client: Client) -> KubeClusterClient {
        KubeClusterClient { client }
    }

    async fn find_api_resource(
        &self,
        gvk: &GroupVersionKind,
        resource: &str,
    ) -> Result<(kube::core::ApiResource, bool), ClusterError> {
        let key = gvk_cache_key(gvk);
        if let Some((ar, ns)) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
            return Ok((ar, ns));
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ClusterError::classify(resource, e))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE
                    .write()
                    .unwrap()
                    .insert(gvk_cache_key(&GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)), (ar.clone(), namespaced));
            }
        }
        DISCOVERY_CACHE.read().unwrap().get(&key).cloned().ok_or_else(|| ClusterError::Other {
            resource: resource.to_string(),
            message: format!("kind not served by cluster: {}", key),
        })
    }

    async fn api_for(
        &self,
        id: &ResourceId,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let gvk = GroupVersionKind::gvk(&id.group, &id.version, &id.kind);
        let (ar, namespaced) = self.find_api_resource(&gvk, &id.to_string()).await?;
        if namespaced {
            match &id.namespace {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ClusterError::Invalid {
                    resource: id.to_string(),
                    message: "namespace required for namespaced kind".to_string(),
                }),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

fn to_dynamic(res: &Resource) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(res.as_value().clone()).map_err(|e| ClusterError::Invalid {
        resource: res.description(),
        message: e.to_string(),
    })
}

fn from_dynamic(resource: &str, obj: &DynamicObject) -> Result<Resource, ClusterError> {
    let value = serde_json::to_value(obj).map_err(|e| ClusterError::Other {
        resource: resource.to_string(),
        message: e.to_string(),
    })?;
    Resource::from_value(value).map_err(|e| ClusterError::Other {
        resource: resource.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, id: &ResourceId) -> Result<Resource, ClusterError> {
        let api = self.api_for(id).await?;
        let obj = api.get(&id.name).await.map_err(|e| ClusterError::classify(&id.to_string(), e))?;
        from_dynamic(&id.to_string(), &obj)
    }

    async fn create(&self, res: &Resource) -> Result<Resource, ClusterError> {
        let api = self.api_for(&res.id()).await?;
        let obj = to_dynamic(res)?;
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| ClusterError::classify(&res.description(), e))?;
        from_dynamic(&res.description(), &created)
    }

    async fn update(
        &self,
        res: &Resource,
        strategy: UpdateStrategy,
    ) -> Result<Resource, ClusterError> {
        let api = self.api_for(&res.id()).await?;
        let pp = PatchParams::default();
        let value = res.as_value().clone();
        let result = match strategy {
            UpdateStrategy::StrategicMergePatch => {
                api.patch(res.name(), &pp, &Patch::Strategic(&value)).await
            }
            UpdateStrategy::JsonMergePatch => api.patch(res.name(), &pp, &Patch::Merge(&value)).await,
        };
        let updated = result.map_err(|e| ClusterError::classify(&res.description(), e))?;
        from_dynamic(&res.description(), &updated)
    }

    async fn delete(
        &self,
        id: &ResourceId,
        propagation: DeletePropagation,
    ) -> Result<(), ClusterError> {
        let api = self.api_for(id).await?;
        let policy = match propagation {
            DeletePropagation::Foreground => kube::api::PropagationPolicy::Foreground,
            DeletePropagation::Background => kube::api::PropagationPolicy::Background,
            DeletePropagation::Orphan => kube::api::PropagationPolicy::Orphan,
        };
        let dp = DeleteParams { propagation_policy: Some(policy), ..Default::default() };
        api.delete(&id.name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::classify(&id.to_string(), e))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<Resource>, ClusterError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ClusterError::classify("(discovery)", e))?;
        let lp = ListParams::default().labels(&selector.as_label_query());
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                let listed = match api.list(&lp).await {
                    Ok(listed) => listed,
                    Err(e) => {
                        // Partial visibility (RBAC) shouldn't sink the whole
                        // enumeration; surface it and move on.
                        warn!(kind = %ar.kind, error = %e, "listing kind failed; skipping");
                        continue;
                    }
                };
                debug!(kind = %ar.kind, count = listed.items.len(), "listed");
                for obj in &listed.items {
                    let label = format!("{}/{}", ar.kind, obj.metadata.name.as_deref().unwrap_or(""));
                    // List items come back without type metadata; restore it
                    // from the discovered resource before wrapping.
                    let mut value = serde_json::to_value(obj).map_err(|e| ClusterError::Other {
                        resource: label.clone(),
                        message: e.to_string(),
                    })?;
                    if value.get("apiVersion").is_none() {
                        value["apiVersion"] = serde_json::Value::String(ar.api_version.clone());
                    }
                    if value.get("kind").is_none() {
                        value["kind"] = serde_json::Value::String(ar.kind.clone());
                    }
                    out.push(Resource::from_value(value).map_err(|e| ClusterError::Other {
                        resource: label,
                        message: e.to_string(),
                    })?);
                }
            }
        }
        Ok(out)
    }
}
