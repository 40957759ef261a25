//! Kubernetes adapter for the `ClusterClient` port.

use crate::crd::MultiClusterHub;
use crate::domain::ports::{ClusterClient, GroupVersionResource, NamespacedName};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

/// `ClusterClient` backed by a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge-patch the hub's finalizer list
    async fn patch_hub_finalizers(
        &self,
        key: &NamespacedName,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<MultiClusterHub> = self.namespaced(&key.namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    fn dynamic_api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn object_namespace<K: kube::Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

fn object_name<K: kube::Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

/// Group, version and kind of an untyped object
fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj
        .types
        .as_ref()
        .ok_or(Error::MissingObjectKey(".apiVersion"))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

async fn create_in<K>(api: Api<K>, obj: &K) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj).await?;
    Ok(())
}

async fn replace_in<K>(api: Api<K>, obj: &K) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(&object_name(obj)?, &PostParams::default(), obj)
        .await?;
    Ok(())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_hub(&self, key: &NamespacedName) -> Result<Option<MultiClusterHub>> {
        let api: Api<MultiClusterHub> = self.namespaced(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn update_hub(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub> {
        let api: Api<MultiClusterHub> = self.namespaced(&object_namespace(hub)?);
        Ok(api
            .replace(&hub.name_any(), &PostParams::default(), hub)
            .await?)
    }

    async fn update_hub_status(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub> {
        let api: Api<MultiClusterHub> = self.namespaced(&object_namespace(hub)?);
        let body = serde_json::to_vec(hub)?;
        Ok(api
            .replace_status(&hub.name_any(), &PostParams::default(), body)
            .await?)
    }

    async fn add_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let api: Api<MultiClusterHub> = self.namespaced(&key.namespace);
        let hub = api.get(&key.name).await?;
        let mut finalizers = hub.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_hub_finalizers(key, finalizers).await
    }

    async fn remove_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()> {
        let api: Api<MultiClusterHub> = self.namespaced(&key.namespace);
        let Some(hub) = api.get_opt(&key.name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = hub
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.patch_hub_finalizers(key, finalizers).await
    }

    async fn get_deployment(&self, key: &NamespacedName) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = self.namespaced(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        create_in(self.namespaced(&object_namespace(deployment)?), deployment).await
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        replace_in(self.namespaced(&object_namespace(deployment)?), deployment).await
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.namespaced(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_service(&self, key: &NamespacedName) -> Result<Option<Service>> {
        let api: Api<Service> = self.namespaced(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        create_in(self.namespaced(&object_namespace(service)?), service).await
    }

    async fn replace_service(&self, service: &Service) -> Result<()> {
        replace_in(self.namespaced(&object_namespace(service)?), service).await
    }

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>> {
        let api: Api<Secret> = self.namespaced(&key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        create_in(self.namespaced(&object_namespace(secret)?), secret).await
    }

    async fn get_dynamic(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        // Kind only feeds type metadata; the URL is built from the plural
        let api = self.dynamic_api(&gvr.api_resource(""), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_dynamic(&self, gvr: &GroupVersionResource, obj: &DynamicObject) -> Result<()> {
        let kind = gvk_of(obj)?.kind;
        let ns = obj.namespace();
        create_in(self.dynamic_api(&gvr.api_resource(&kind), ns.as_deref()), obj).await
    }

    async fn replace_dynamic(
        &self,
        gvr: &GroupVersionResource,
        obj: &DynamicObject,
    ) -> Result<()> {
        let kind = gvk_of(obj)?.kind;
        let ns = obj.namespace();
        replace_in(self.dynamic_api(&gvr.api_resource(&kind), ns.as_deref()), obj).await
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<()> {
        let gvk = gvk_of(obj)?;
        let name = object_name(obj)?;
        let (ar, caps) = pinned_kind(&self.client, &gvk).await?;

        let api = match caps.scope {
            Scope::Namespaced => {
                let ns = object_namespace(obj)?;
                Api::<DynamicObject>::namespaced_with(self.client.clone(), &ns, &ar)
            }
            Scope::Cluster => Api::<DynamicObject>::all_with(self.client.clone(), &ar),
        };

        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&name, &params, &Patch::Apply(obj)).await?;
        debug!(kind = %gvk.kind, name = %name, "Applied manifest");
        Ok(())
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<bool> {
        let gvk = gvk_of(obj)?;
        let name = object_name(obj)?;
        let (ar, caps) = match pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            // Kind not served, so no object of it can exist
            Err(kube::Error::Discovery(_)) => return Ok(false),
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let api = match caps.scope {
            Scope::Namespaced => {
                let ns = object_namespace(obj)?;
                Api::<DynamicObject>::namespaced_with(self.client.clone(), &ns, &ar)
            }
            Scope::Cluster => Api::<DynamicObject>::all_with(self.client.clone(), &ar),
        };

        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(kind = %gvk.kind, name = %name, "Deleted object");
                Ok(true)
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn api_group_version_served(&self, group: &str, version: &str) -> Result<bool> {
        let group_version = format!("{}/{}", group, version);
        match self.client.list_api_group_resources(&group_version).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
