//! Dependent Resource Builders
//!
//! Desired-state descriptors for the objects the pipeline ensures, built
//! just-in-time from the current hub. They are compared against the live
//! objects of the same kind and name and never persisted on their own.

use crate::crd::MultiClusterHub;
use crate::domain::ports::GroupVersionResource;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

/// Name shared by the helm repo deployment, its service and its pod label
pub const HELM_REPO_NAME: &str = "multiclusterhub-repo";

/// Port the helm repo serves charts on
pub const HELM_REPO_PORT: i32 = 3000;

/// Name of the helm channel
pub const HELM_CHANNEL_NAME: &str = "charts-v1";

/// API group and version of channels and subscriptions
pub const APPS_GROUP: &str = "apps.open-cluster-management.io";
pub const APPS_VERSION: &str = "v1";

pub fn channel_resource() -> GroupVersionResource {
    GroupVersionResource::new(APPS_GROUP, APPS_VERSION, "channels")
}

pub fn subscription_resource() -> GroupVersionResource {
    GroupVersionResource::new(APPS_GROUP, APPS_VERSION, "subscriptions")
}

// =============================================================================
// Ownership
// =============================================================================

/// Controller owner reference pointing at the hub.
///
/// `None` when the hub has no UID yet, which only happens for objects that
/// were never persisted.
pub fn hub_owner_reference(hub: &MultiClusterHub) -> Option<OwnerReference> {
    hub.controller_owner_ref(&())
}

/// Set the hub as controller owner of `meta`, logging instead of failing when
/// the reference cannot be built. Returns whether the reference was set.
pub fn attach_owner(hub: &MultiClusterHub, meta: &mut ObjectMeta) -> bool {
    match hub_owner_reference(hub) {
        Some(owner) => {
            let refs = meta.owner_references.get_or_insert_with(Vec::new);
            refs.retain(|r| r.controller != Some(true) || r.uid == owner.uid);
            if !refs.iter().any(|r| r.uid == owner.uid) {
                refs.push(owner);
            }
            true
        }
        None => {
            warn!(
                hub = %hub.name_any(),
                object = meta.name.as_deref().unwrap_or("<unnamed>"),
                "Failed to set controller reference"
            );
            false
        }
    }
}

/// Whether `meta` carries an owner reference to the hub
pub fn is_owned_by(hub: &MultiClusterHub, meta: &ObjectMeta) -> bool {
    match hub.uid() {
        Some(uid) => meta
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.uid == uid))
            .unwrap_or(false),
        None => false,
    }
}

// =============================================================================
// Resource Builder
// =============================================================================

/// Builder for the dependents of one hub
pub struct ResourceBuilder<'a> {
    hub: &'a MultiClusterHub,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a builder; the hub must be namespaced
    pub fn new(hub: &'a MultiClusterHub) -> Result<Self> {
        let namespace = hub
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        Ok(Self { hub, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn metadata(&self, name: &str, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
        let mut meta = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels,
            ..Default::default()
        };
        attach_owner(self.hub, &mut meta);
        meta
    }

    fn helm_repo_labels() -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), HELM_REPO_NAME.to_string())])
    }

    /// Image reference for a hub component
    pub fn image(&self, component: &str) -> String {
        format!(
            "{}/{}:{}",
            self.hub.spec.image_repository, component, self.hub.spec.version
        )
    }

    /// Deployment serving the hub's helm charts
    pub fn helm_repo_deployment(&self) -> Deployment {
        let labels = Self::helm_repo_labels();

        let container = Container {
            name: HELM_REPO_NAME.to_string(),
            image: Some(self.image(HELM_REPO_NAME)),
            image_pull_policy: Some(self.hub.spec.image_pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                container_port: HELM_REPO_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(HELM_REPO_NAME, Some(labels.clone())),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Service in front of the helm repo
    pub fn helm_repo_service(&self) -> Service {
        let labels = Self::helm_repo_labels();

        Service {
            metadata: self.metadata(HELM_REPO_NAME, Some(labels.clone())),
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    port: HELM_REPO_PORT,
                    target_port: Some(IntOrString::Int(HELM_REPO_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Channel pointing at the helm repo service
    pub fn helm_channel(&self) -> DynamicObject {
        let pathname = format!(
            "http://{}.{}.svc.cluster.local:{}/charts",
            HELM_REPO_NAME, self.namespace, HELM_REPO_PORT
        );
        self.dynamic(
            &channel_resource(),
            "Channel",
            HELM_CHANNEL_NAME,
            json!({ "type": "HelmRepo", "pathname": pathname }),
        )
    }

    /// Subscription installing the cert-manager chart
    pub fn cert_manager_subscription(&self) -> DynamicObject {
        self.chart_subscription("cert-manager")
    }

    /// Subscription installing the cert-manager webhook chart
    pub fn cert_webhook_subscription(&self) -> DynamicObject {
        self.chart_subscription("cert-manager-webhook")
    }

    /// Subscription installing the configmap watcher chart
    pub fn config_watcher_subscription(&self) -> DynamicObject {
        self.chart_subscription("configmap-watcher")
    }

    fn chart_subscription(&self, chart: &str) -> DynamicObject {
        let spec = &self.hub.spec;
        self.dynamic(
            &subscription_resource(),
            "Subscription",
            &format!("{}-sub", chart),
            json!({
                "channel": format!("{}/{}", self.namespace, HELM_CHANNEL_NAME),
                "name": chart,
                "placement": { "local": true },
                "packageOverrides": [{
                    "packageName": chart,
                    "packageOverrides": [{
                        "path": "spec.values",
                        "value": {
                            "image": {
                                "repository": spec.image_repository,
                                "tag": spec.version,
                                "pullPolicy": spec.image_pull_policy,
                            }
                        }
                    }]
                }]
            }),
        )
    }

    fn dynamic(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        name: &str,
        spec: serde_json::Value,
    ) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &gvr.api_resource(kind))
            .within(&self.namespace)
            .data(json!({ "spec": spec }));
        attach_owner(self.hub, &mut obj.metadata);
        obj
    }
}
