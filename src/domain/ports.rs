//! Domain Ports - Core trait definitions for the hub operator
//!
//! These traits define the boundaries between the reconciliation pipeline and
//! the cluster it drives. The pipeline only ever talks to a `ClusterClient`
//! and a `Renderer`; adapters implement them against a real API server.

use crate::crd::MultiClusterHub;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use std::sync::Arc;

// =============================================================================
// Object Identity
// =============================================================================

/// Namespace-qualified name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Group, version and plural resource name of an API type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// `<group>/<version>`, or just `<version>` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `<resource>.<group>`, the form used in API server messages
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }

    /// ApiResource for dynamic access; `kind` is only used for type metadata
    pub fn api_resource(&self, kind: &str) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&self.group, &self.version, kind),
            &self.resource,
        )
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.group_resource())
    }
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for every cluster operation the pipeline performs
///
/// Gets return `Ok(None)` when the object does not exist, so callers see an
/// explicit found / not-found / error trichotomy. Conflicts are reported as
/// errors for which `Error::is_conflict()` holds.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // ----- hub resource ------------------------------------------------------

    /// Fetch the hub resource
    async fn get_hub(&self, key: &NamespacedName) -> Result<Option<MultiClusterHub>>;

    /// Full update of the hub object (spec and metadata)
    async fn update_hub(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub>;

    /// Write the hub's status subresource
    async fn update_hub_status(&self, hub: &MultiClusterHub) -> Result<MultiClusterHub>;

    /// Add a finalizer to the hub; no-op when already present
    async fn add_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from the hub
    async fn remove_hub_finalizer(&self, key: &NamespacedName, finalizer: &str) -> Result<()>;

    // ----- typed dependents --------------------------------------------------

    async fn get_deployment(&self, key: &NamespacedName) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// List all deployments in a namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    async fn get_service(&self, key: &NamespacedName) -> Result<Option<Service>>;

    async fn create_service(&self, service: &Service) -> Result<()>;

    async fn replace_service(&self, service: &Service) -> Result<()>;

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    // ----- untyped access ----------------------------------------------------

    /// Fetch an arbitrary object; `namespace` is `None` for cluster-scoped types
    async fn get_dynamic(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn create_dynamic(&self, gvr: &GroupVersionResource, obj: &DynamicObject) -> Result<()>;

    async fn replace_dynamic(&self, gvr: &GroupVersionResource, obj: &DynamicObject)
        -> Result<()>;

    /// Idempotent create-or-update of a rendered manifest
    async fn apply(&self, obj: &DynamicObject) -> Result<()>;

    /// Delete the object identified by the type metadata, name and namespace
    /// of `obj`. Returns `false` when there was nothing to delete, including
    /// when the cluster does not serve its kind.
    async fn delete(&self, obj: &DynamicObject) -> Result<bool>;

    // ----- cluster queries ---------------------------------------------------

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;

    /// Whether `<group>/<version>` is registered with the API server
    async fn api_group_version_served(&self, group: &str, version: &str) -> Result<bool>;
}

// =============================================================================
// Renderer Port
// =============================================================================

/// Cluster facts a renderer may substitute into manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    pub ingress_domain: Option<String>,
}

/// Port for turning the (defaulted) hub into manifests
///
/// Must be deterministic: identical input yields identical output.
pub trait Renderer: Send + Sync {
    fn render(&self, hub: &MultiClusterHub, ctx: &RenderContext) -> Result<Vec<DynamicObject>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterClientRef = Arc<dyn ClusterClient>;
pub type RendererRef = Arc<dyn Renderer>;
