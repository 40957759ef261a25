//! In-memory cluster used by the pipeline tests.
//!
//! Behaves like a small API server: creates of existing objects conflict,
//! replaces of missing objects are not found, stale hub writes conflict,
//! finalizers hold a deleted hub, and removing a hub garbage-collects
//! everything it owns. Every call is counted.

use crate::crd::{MultiClusterHub, MultiClusterHubSpec};
use crate::domain::ports::{
    ClusterClient, GroupVersionResource, NamespacedName, RenderContext, Renderer,
};
use crate::error::{api_error, Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::facts::{ingress_config_resource, DEFAULT_STORAGE_CLASS_ANNOTATION, INGRESS_CONFIG_NAME};

type DynamicKey = (String, String, String);

#[derive(Default)]
struct State {
    hubs: BTreeMap<NamespacedName, MultiClusterHub>,
    deployments: BTreeMap<NamespacedName, Deployment>,
    services: BTreeMap<NamespacedName, Service>,
    secrets: BTreeMap<NamespacedName, Secret>,
    /// Keyed by (group resource, namespace, name)
    dynamic: BTreeMap<DynamicKey, DynamicObject>,
    /// Keyed by (kind, namespace, name)
    applied: BTreeMap<DynamicKey, DynamicObject>,
    storage_classes: Vec<StorageClass>,
    served: BTreeSet<String>,
    calls: HashMap<String, usize>,
    mutations: usize,
    resource_version: u64,
    status_conflicts: usize,
    hub_update_conflicts: usize,
    failing_apply_kind: Option<String>,
    /// Operation name to the status code it answers with
    failing_ops: BTreeMap<String, u16>,
}

impl State {
    fn call(&mut self, op: &str) -> Result<()> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        match self.failing_ops.get(op) {
            Some(409) => Err(api_error(409, "Conflict")),
            Some(&code) => Err(api_error(code, "InternalError")),
            None => Ok(()),
        }
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Drop a hub and everything it owns
    fn remove_hub(&mut self, key: &NamespacedName) {
        let Some(hub) = self.hubs.remove(key) else {
            return;
        };
        let Some(uid) = hub.metadata.uid else {
            return;
        };
        self.deployments.retain(|_, o| !owned_by(&o.metadata, &uid));
        self.services.retain(|_, o| !owned_by(&o.metadata, &uid));
        self.secrets.retain(|_, o| !owned_by(&o.metadata, &uid));
        self.dynamic.retain(|_, o| !owned_by(&o.metadata, &uid));
        self.applied.retain(|_, o| !owned_by(&o.metadata, &uid));
    }
}

/// Fake API server implementing `ClusterClient`
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key_of(meta: &ObjectMeta) -> NamespacedName {
    NamespacedName::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == uid))
        .unwrap_or(false)
}

/// A persisted hub with a UID and an empty spec
pub fn test_hub(namespace: &str, name: &str) -> MultiClusterHub {
    let mut hub = MultiClusterHub::new(name, MultiClusterHubSpec::default());
    hub.metadata.namespace = Some(namespace.to_string());
    hub.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    hub
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- seeding -----------------------------------------------------------

    /// Store a hub as if a user had created it
    pub fn insert_hub(&self, mut hub: MultiClusterHub) -> NamespacedName {
        let mut state = self.state.lock();
        hub.metadata.resource_version = Some(state.next_version());
        let key = key_of(&hub.metadata);
        state.hubs.insert(key.clone(), hub);
        key
    }

    pub fn add_storage_class(&self, name: &str, default: bool) {
        let mut sc = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "kubernetes.io/fake".to_string(),
            ..Default::default()
        };
        if default {
            sc.metadata.annotations = Some(BTreeMap::from([(
                DEFAULT_STORAGE_CLASS_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        self.state.lock().storage_classes.push(sc);
    }

    /// Register `<group>/<version>` as served
    pub fn serve(&self, group_version: &str) {
        self.state.lock().served.insert(group_version.to_string());
    }

    /// Install the cluster ingress configuration with the given content
    pub fn set_ingress_config(&self, content: Value) {
        let gvr = ingress_config_resource();
        let obj = DynamicObject::new(INGRESS_CONFIG_NAME, &gvr.api_resource("Ingress"))
            .data(content);
        self.state.lock().dynamic.insert(
            (gvr.group_resource(), String::new(), INGRESS_CONFIG_NAME.to_string()),
            obj,
        );
    }

    /// Store a deployment not managed by the pipeline
    pub fn insert_deployment(&self, deployment: Deployment) {
        let key = key_of(&deployment.metadata);
        self.state.lock().deployments.insert(key, deployment);
    }

    // ----- failure injection -------------------------------------------------

    /// Answer the next `count` status writes with a conflict
    pub fn conflict_status_writes(&self, count: usize) {
        self.state.lock().status_conflicts = count;
    }

    /// Answer the next `count` hub updates with a conflict
    pub fn conflict_hub_updates(&self, count: usize) {
        self.state.lock().hub_update_conflicts = count;
    }

    /// Fail every apply of objects of `kind`
    pub fn fail_apply_of(&self, kind: &str) {
        self.state.lock().failing_apply_kind = Some(kind.to_string());
    }

    /// Fail every call of operation `op` with a server error
    pub fn fail_op(&self, op: &str) {
        self.state.lock().failing_ops.insert(op.to_string(), 500);
    }

    /// Answer every call of operation `op` with a conflict
    pub fn conflict_op(&self, op: &str) {
        self.state.lock().failing_ops.insert(op.to_string(), 409);
    }

    // ----- out-of-band changes -----------------------------------------------

    /// Report every deployment in `namespace` as fully available
    pub fn mark_deployments_ready(&self, namespace: &str) {
        let mut state = self.state.lock();
        for (key, dep) in state.deployments.iter_mut() {
            if key.namespace != namespace {
                continue;
            }
            let replicas = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            dep.status = Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                available_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                observed_generation: Some(1),
                ..Default::default()
            });
        }
    }

    /// Edit a stored deployment without going through the pipeline
    pub fn edit_deployment(&self, key: &NamespacedName, edit: impl FnOnce(&mut Deployment)) {
        if let Some(dep) = self.state.lock().deployments.get_mut(key) {
            edit(dep);
        }
    }

    /// Edit a stored untyped object without going through the pipeline
    pub fn edit_dynamic(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut DynamicObject),
    ) {
        let key = (gvr.group_resource(), namespace.to_string(), name.to_string());
        if let Some(obj) = self.state.lock().dynamic.get_mut(&key) {
            edit(obj);
        }
    }

    pub fn delete_deployment(&self, key: &NamespacedName) {
        self.state.lock().deployments.remove(key);
    }

    /// Request deletion of a hub. A hub with finalizers only gets a deletion
    /// timestamp; otherwise it is removed and everything it owns is
    /// garbage-collected.
    pub fn delete_hub(&self, key: &NamespacedName) {
        let mut state = self.state.lock();
        let Some(hub) = state.hubs.get_mut(key) else {
            return;
        };
        if hub.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            hub.metadata.deletion_timestamp =
                serde_json::from_value(serde_json::json!("2024-05-01T10:00:00Z")).ok();
            return;
        }
        state.remove_hub(key);
    }

    // ----- inspection --------------------------------------------------------

    /// Creates, replaces, deletes and hub updates issued so far
    pub fn mutations(&self) -> usize {
        self.state.lock().mutations
    }

    /// Number of times operation `op` was called
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn hub(&self, key: &NamespacedName) -> Option<MultiClusterHub> {
        self.state.lock().hubs.get(key).cloned()
    }

    pub fn deployment(&self, key: &NamespacedName) -> Option<Deployment> {
        self.state.lock().deployments.get(key).cloned()
    }

    pub fn service(&self, key: &NamespacedName) -> Option<Service> {
        self.state.lock().services.get(key).cloned()
    }

    pub fn secret(&self, key: &NamespacedName) -> Option<Secret> {
        self.state.lock().secrets.get(key).cloned()
    }

    pub fn dynamic(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        let key = (gvr.group_resource(), namespace.to_string(), name.to_string());
        self.state.lock().dynamic.get(&key).cloned()
    }

    pub fn applied(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        self.state.lock().applied.get(&key).cloned()
    }

    /// Total number of objects held, hubs and storage classes excluded
    pub fn object_count(&self) -> usize {
        let state = self.state.lock();
        state.deployments.len()
            + state.services.len()
            + state.secrets.len()
            + state.applied.len()
            + state
                .dynamic
                .keys()
                .filter(|(gr, _, _)| *gr != ingress_config_resource().group_resource())
                .count()
    }
}

fn create_into<T: Clone>(
    state: &mut State,
    map: impl FnOnce(&mut State) -> &mut BTreeMap<NamespacedName, T>,
    key: NamespacedName,
    obj: &T,
) -> Result<()> {
    let map = map(state);
    if map.contains_key(&key) {
        return Err(api_error(409, "AlreadyExists"));
    }
    map.insert(key, obj.clone());
    state.mutations += 1;
    Ok(())
}

fn replace_into<T: Clone>(
    state: &mut State,
    map: impl FnOnce(&mut State) -> &mut BTreeMap<NamespacedName, T>,
    key: NamespacedName,
    obj: &T,
) -> Result<()> {
    let map = map(state);
    if !map.contains_key(&key) {
        return Err(api_error(404, "NotFound"));
    }
    map.insert(key, obj.clone());
    state.mutations += 1;
    Ok(())
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_hub(&self, key: &NamespacedName) -> Result<Option<MultiClusterHub>> {
        let mut state = self.state.lock();
        state.call("get_hub")?;
        Ok(state.hubs.get(key).cloned())
    }

    async fn update_hub(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub> {
        let mut state = self.state.lock();
        state.call("update_hub")?;
        if state.hub_update_conflicts > 0 {
            state.hub_update_conflicts -= 1;
            return Err(api_error(409, "Conflict"));
        }
        let key = key_of(&hub.metadata);
        let live = state
            .hubs
            .get(&key)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if live.metadata.resource_version != hub.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        let status = live.status.clone();
        let mut updated = hub.clone();
        updated.status = status;
        updated.metadata.resource_version = Some(state.next_version());
        state.hubs.insert(key, updated.clone());
        state.mutations += 1;
        Ok(updated)
    }

    async fn update_hub_status(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub> {
        let mut state = self.state.lock();
        state.call("update_hub_status")?;
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(api_error(409, "Conflict"));
        }
        let key = key_of(&hub.metadata);
        let version = state.next_version();
        let live = state
            .hubs
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if live.metadata.resource_version != hub.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        live.status = hub.status.clone();
        live.metadata.resource_version = Some(version);
        Ok(live.clone())
    }

    async fn add_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call("add_hub_finalizer")?;
        let version = state.next_version();
        let hub = state
            .hubs
            .get_mut(key)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        let finalizers = hub.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        hub.metadata.resource_version = Some(version);
        state.mutations += 1;
        Ok(())
    }

    async fn remove_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.call("remove_hub_finalizer")?;
        let version = state.next_version();
        let Some(hub) = state.hubs.get_mut(key) else {
            return Ok(());
        };
        let finalizers = hub.metadata.finalizers.get_or_insert_with(Vec::new);
        finalizers.retain(|f| f != finalizer);
        let released = finalizers.is_empty() && hub.metadata.deletion_timestamp.is_some();
        hub.metadata.resource_version = Some(version);
        state.mutations += 1;
        if released {
            state.remove_hub(key);
        }
        Ok(())
    }

    async fn get_deployment(&self, key: &NamespacedName) -> Result<Option<Deployment>> {
        let mut state = self.state.lock();
        state.call("get_deployment")?;
        Ok(state.deployments.get(key).cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut state = self.state.lock();
        state.call("create_deployment")?;
        create_into(
            &mut state,
            |s| &mut s.deployments,
            key_of(&deployment.metadata),
            deployment,
        )
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut state = self.state.lock();
        state.call("replace_deployment")?;
        replace_into(
            &mut state,
            |s| &mut s.deployments,
            key_of(&deployment.metadata),
            deployment,
        )
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let mut state = self.state.lock();
        state.call("list_deployments")?;
        Ok(state
            .deployments
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_service(&self, key: &NamespacedName) -> Result<Option<Service>> {
        let mut state = self.state.lock();
        state.call("get_service")?;
        Ok(state.services.get(key).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        let mut state = self.state.lock();
        state.call("create_service")?;
        create_into(&mut state, |s| &mut s.services, key_of(&service.metadata), service)
    }

    async fn replace_service(&self, service: &Service) -> Result<()> {
        let mut state = self.state.lock();
        state.call("replace_service")?;
        replace_into(&mut state, |s| &mut s.services, key_of(&service.metadata), service)
    }

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>> {
        let mut state = self.state.lock();
        state.call("get_secret")?;
        Ok(state.secrets.get(key).cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.state.lock();
        state.call("create_secret")?;
        create_into(&mut state, |s| &mut s.secrets, key_of(&secret.metadata), secret)
    }

    async fn get_dynamic(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let mut state = self.state.lock();
        state.call("get_dynamic")?;
        state.call(&format!("get_dynamic:{}", gvr.group_resource()))?;
        let key = (
            gvr.group_resource(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        Ok(state.dynamic.get(&key).cloned())
    }

    async fn create_dynamic(&self, gvr: &GroupVersionResource, obj: &DynamicObject) -> Result<()> {
        let mut state = self.state.lock();
        state.call("create_dynamic")?;
        let key = (gvr.group_resource(), obj.namespace().unwrap_or_default(), obj.name_any());
        if state.dynamic.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.dynamic.insert(key, obj.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn replace_dynamic(
        &self,
        gvr: &GroupVersionResource,
        obj: &DynamicObject,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.call("replace_dynamic")?;
        let key = (gvr.group_resource(), obj.namespace().unwrap_or_default(), obj.name_any());
        if !state.dynamic.contains_key(&key) {
            return Err(api_error(404, "NotFound"));
        }
        state.dynamic.insert(key, obj.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<()> {
        let mut state = self.state.lock();
        state.call("apply")?;
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or(Error::MissingObjectKey(".kind"))?;
        if state.failing_apply_kind.as_deref() == Some(kind.as_str()) {
            return Err(api_error(500, "InternalError"));
        }
        let key = (kind, obj.namespace().unwrap_or_default(), obj.name_any());
        state.applied.insert(key, obj.clone());
        Ok(())
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<bool> {
        let mut state = self.state.lock();
        state.call("delete")?;
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or(Error::MissingObjectKey(".kind"))?;
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = NamespacedName::new(namespace.clone(), name.clone());

        let removed = match kind.as_str() {
            "Deployment" => state.deployments.remove(&key).is_some(),
            "Service" => state.services.remove(&key).is_some(),
            "Secret" => state.secrets.remove(&key).is_some(),
            _ => {
                let before = state.dynamic.len() + state.applied.len();
                state.dynamic.retain(|(_, ns, n), o| {
                    let same_kind = o.types.as_ref().is_some_and(|t| t.kind == kind);
                    !(same_kind && *ns == namespace && *n == name)
                });
                state.applied.remove(&(kind.clone(), namespace.clone(), name.clone()));
                state.dynamic.len() + state.applied.len() < before
            }
        };
        if removed {
            state.mutations += 1;
        }
        Ok(removed)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let mut state = self.state.lock();
        state.call("list_storage_classes")?;
        Ok(state.storage_classes.clone())
    }

    async fn api_group_version_served(&self, group: &str, version: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.call("api_group_version_served")?;
        Ok(state.served.contains(&format!("{}/{}", group, version)))
    }
}

/// Renderer returning a fixed set of manifests in every namespace
pub struct StaticRenderer {
    objects: Vec<DynamicObject>,
}

impl StaticRenderer {
    pub fn new(objects: Vec<DynamicObject>) -> Self {
        Self { objects }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Renderer for StaticRenderer {
    fn render(&self, hub: &MultiClusterHub, _ctx: &RenderContext) -> Result<Vec<DynamicObject>> {
        let namespace = hub.namespace().unwrap_or_default();
        Ok(self
            .objects
            .iter()
            .cloned()
            .map(|mut obj| {
                if obj.metadata.namespace.is_none() {
                    obj.metadata.namespace = Some(namespace.clone());
                }
                obj
            })
            .collect())
    }
}
