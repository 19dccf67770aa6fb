//! In-memory cluster fake used by the executor tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use berth_cluster::{
    ClusterClient, ClusterError, DeletePropagation, Selector, UpdateStrategy,
};
use berth_core::{Path, Resource, ResourceId};

#[derive(Default)]
pub struct FakeCluster {
    store: Mutex<HashMap<ResourceId, Resource>>,
    calls: Mutex<Vec<String>>,
    /// Each queued entry hijacks one update call: the live resource is
    /// swapped for the replacement (a concurrent writer) and Conflict is
    /// returned to the caller.
    conflicts: Mutex<Vec<Resource>>,
    fail_creates: Mutex<HashSet<ResourceId>>,
    rv: AtomicU64,
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn with_rv(&self, res: &Resource) -> Resource {
        let mut out = res.deep_copy();
        out.set(
            &Path::from_keys(&["metadata", "resourceVersion"]),
            serde_json::Value::String(self.next_rv()),
        )
        .unwrap();
        out
    }

    pub fn seed(&self, res: Resource) {
        let stored = self.with_rv(&res);
        self.store.lock().unwrap().insert(stored.id(), stored);
    }

    pub fn queue_conflict(&self, replacement: Resource) {
        self.conflicts.lock().unwrap().push(replacement);
    }

    pub fn fail_create(&self, id: ResourceId) {
        self.fail_creates.lock().unwrap().insert(id);
    }

    pub fn stored(&self, id: &ResourceId) -> Option<Resource> {
        self.store.lock().unwrap().get(id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                c.starts_with("create") || c.starts_with("update") || c.starts_with("delete")
            })
            .count()
    }

    fn log(&self, verb: &str, id: &ResourceId) {
        self.calls.lock().unwrap().push(format!("{} {}", verb, id));
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Resource, ClusterError> {
        self.log("get", id);
        self.store
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }

    async fn create(&self, res: &Resource) -> Result<Resource, ClusterError> {
        let id = res.id();
        self.log("create", &id);
        if self.fail_creates.lock().unwrap().contains(&id) {
            return Err(ClusterError::Forbidden {
                resource: id.to_string(),
                message: "denied by test".to_string(),
            });
        }
        let mut store = self.store.lock().unwrap();
        if store.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(id.to_string()));
        }
        let stored = self.with_rv(res);
        store.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        res: &Resource,
        _strategy: UpdateStrategy,
    ) -> Result<Resource, ClusterError> {
        let id = res.id();
        self.log("update", &id);
        let next_conflict = {
            let mut conflicts = self.conflicts.lock().unwrap();
            if conflicts.is_empty() { None } else { Some(conflicts.remove(0)) }
        };
        if let Some(replacement) = next_conflict {
            let swapped = self.with_rv(&replacement);
            self.store.lock().unwrap().insert(swapped.id(), swapped);
            return Err(ClusterError::Conflict {
                resource: id.to_string(),
                reason: "Conflict".to_string(),
            });
        }
        let mut store = self.store.lock().unwrap();
        let live = store
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        if res.resource_version().is_some() && res.resource_version() != live.resource_version() {
            return Err(ClusterError::Conflict {
                resource: id.to_string(),
                reason: "Conflict".to_string(),
            });
        }
        let stored = self.with_rv(res);
        store.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        id: &ResourceId,
        _propagation: DeletePropagation,
    ) -> Result<(), ClusterError> {
        self.log("delete", id);
        match self.store.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(id.to_string())),
        }
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<Resource>, ClusterError> {
        self.calls.lock().unwrap().push(format!("list {}", selector.as_label_query()));
        Ok(self
            .store
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.labels().get(&selector.key) == Some(&selector.value))
            .cloned()
            .collect())
    }
}
