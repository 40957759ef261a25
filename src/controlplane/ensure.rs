//! Dependent-Resource Ensurer
//!
//! One operation per dependent kind. Each fetches the live object, creates it
//! when missing (and asks for a requeue), leaves it alone when the fields the
//! operator owns already match, and repairs those fields otherwise.

use crate::domain::ports::{ClusterClient, GroupVersionResource, NamespacedName};
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::pipeline::StepOutcome;

fn object_key(namespace: Option<String>, name: String) -> NamespacedName {
    NamespacedName::new(namespace.unwrap_or_default(), name)
}

/// Outcome of a create or replace. A conflict means another writer got there
/// first, so the pass ends and the next one starts from fresh state.
fn write_outcome(
    result: Result<()>,
    done: StepOutcome,
    kind: &str,
    key: &NamespacedName,
) -> Result<StepOutcome> {
    match result {
        Ok(()) => Ok(done),
        Err(e) if e.is_conflict() => {
            debug!(kind = %kind, object = %key, error = %e, "Write conflicted, requeueing");
            Ok(StepOutcome::Requeue)
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Deployments
// =============================================================================

/// Ensure a deployment exists with the desired replicas and container images
pub async fn ensure_deployment(
    client: &dyn ClusterClient,
    desired: &Deployment,
) -> Result<StepOutcome> {
    let key = object_key(desired.namespace(), desired.name_any());

    let Some(live) = client.get_deployment(&key).await? else {
        info!(kind = "Deployment", object = %key, "Creating deployment");
        let created = client.create_deployment(desired).await;
        return write_outcome(created, StepOutcome::Requeue, "Deployment", &key);
    };

    match reconcile_deployment(&live, desired) {
        None => {
            debug!(kind = "Deployment", object = %key, "Deployment up to date");
            Ok(StepOutcome::Continue)
        }
        Some(updated) => {
            info!(kind = "Deployment", object = %key, "Updating drifted deployment");
            let replaced = client.replace_deployment(&updated).await;
            write_outcome(replaced, StepOutcome::Continue, "Deployment", &key)
        }
    }
}

/// Live deployment with the owned fields set from `desired`, or `None` when
/// nothing differs. Fields the operator does not own are carried over.
pub fn reconcile_deployment(live: &Deployment, desired: &Deployment) -> Option<Deployment> {
    let desired_spec = desired.spec.as_ref()?;
    let mut updated = live.clone();
    let mut changed = false;

    let spec = updated.spec.get_or_insert_with(Default::default);
    if spec.replicas != desired_spec.replicas {
        spec.replicas = desired_spec.replicas;
        changed = true;
    }

    let desired_containers = desired_spec
        .template
        .spec
        .as_ref()
        .map(|p| p.containers.as_slice())
        .unwrap_or_default();
    let pod = spec.template.spec.get_or_insert_with(Default::default);

    for want in desired_containers {
        match pod.containers.iter_mut().find(|c| c.name == want.name) {
            Some(have) => {
                if have.image != want.image {
                    have.image = want.image.clone();
                    changed = true;
                }
                if have.image_pull_policy != want.image_pull_policy {
                    have.image_pull_policy = want.image_pull_policy.clone();
                    changed = true;
                }
            }
            None => {
                pod.containers.push(want.clone());
                changed = true;
            }
        }
    }

    changed.then_some(updated)
}

// =============================================================================
// Services
// =============================================================================

/// Ensure a service exists with the desired ports and selector
pub async fn ensure_service(client: &dyn ClusterClient, desired: &Service) -> Result<StepOutcome> {
    let key = object_key(desired.namespace(), desired.name_any());

    let Some(live) = client.get_service(&key).await? else {
        info!(kind = "Service", object = %key, "Creating service");
        let created = client.create_service(desired).await;
        return write_outcome(created, StepOutcome::Requeue, "Service", &key);
    };

    match reconcile_service(&live, desired) {
        None => Ok(StepOutcome::Continue),
        Some(updated) => {
            info!(kind = "Service", object = %key, "Updating drifted service");
            let replaced = client.replace_service(&updated).await;
            write_outcome(replaced, StepOutcome::Continue, "Service", &key)
        }
    }
}

/// Live service with ports and selector set from `desired`, or `None` when
/// they already match
pub fn reconcile_service(live: &Service, desired: &Service) -> Option<Service> {
    let desired_spec = desired.spec.as_ref()?;
    let mut updated = live.clone();
    let spec = updated.spec.get_or_insert_with(Default::default);

    let ports_match =
        port_signature(spec.ports.as_deref()) == port_signature(desired_spec.ports.as_deref());
    let selector_match = normalize(&spec.selector) == normalize(&desired_spec.selector);
    if ports_match && selector_match {
        return None;
    }

    spec.ports = desired_spec.ports.clone();
    spec.selector = desired_spec.selector.clone();
    Some(updated)
}

/// Port fields the operator sets; server-populated fields like node ports
/// are ignored
fn port_signature(ports: Option<&[ServicePort]>) -> Vec<(i32, String, String)> {
    ports
        .unwrap_or_default()
        .iter()
        .map(|p| {
            let target = p
                .target_port
                .as_ref()
                .map(|t| match t {
                    IntOrString::Int(i) => i.to_string(),
                    IntOrString::String(s) => s.clone(),
                })
                .unwrap_or_else(|| p.port.to_string());
            let protocol = p.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            (p.port, target, protocol)
        })
        .collect()
}

fn normalize(map: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.clone().unwrap_or_default()
}

// =============================================================================
// Channels and Subscriptions
// =============================================================================

/// Ensure an untyped object (channel or subscription) exists with the
/// desired `spec`.
///
/// Spec repairs request a requeue: the subscription operator picks changes up
/// asynchronously.
pub async fn ensure_dynamic(
    client: &dyn ClusterClient,
    gvr: &GroupVersionResource,
    desired: &DynamicObject,
) -> Result<StepOutcome> {
    let namespace = desired.namespace();
    let name = desired.name_any();
    let key = object_key(namespace.clone(), name.clone());

    let Some(live) = client.get_dynamic(gvr, namespace.as_deref(), &name).await? else {
        info!(kind = %gvr.resource, object = %key, "Creating object");
        let created = client.create_dynamic(gvr, desired).await;
        return write_outcome(created, StepOutcome::Requeue, &gvr.resource, &key);
    };

    let want = desired.data.get("spec");
    if live.data.get("spec") == want {
        debug!(kind = %gvr.resource, object = %key, "Object up to date");
        return Ok(StepOutcome::Continue);
    }

    info!(kind = %gvr.resource, object = %key, "Updating drifted object spec");
    let mut updated = live;
    let spec = want.cloned().unwrap_or(serde_json::Value::Null);
    match updated.data.as_object_mut() {
        Some(content) => {
            content.insert("spec".to_string(), spec);
        }
        None => updated.data = serde_json::json!({ "spec": spec }),
    }
    let replaced = client.replace_dynamic(gvr, &updated).await;
    write_outcome(replaced, StepOutcome::Requeue, &gvr.resource, &key)
}

// =============================================================================
// Secrets
// =============================================================================

/// Ensure a secret exists. A live secret is never overwritten.
pub async fn ensure_secret(client: &dyn ClusterClient, desired: &Secret) -> Result<StepOutcome> {
    let key = object_key(desired.namespace(), desired.name_any());

    if client.get_secret(&key).await?.is_some() {
        debug!(kind = "Secret", object = %key, "Secret exists");
        return Ok(StepOutcome::Continue);
    }

    info!(kind = "Secret", object = %key, "Creating secret");
    let created = client.create_secret(desired).await;
    write_outcome(created, StepOutcome::Requeue, "Secret", &key)
}

// =============================================================================
// API Readiness
// =============================================================================

/// Stop with a descriptive error when an optional API group is not served
pub async fn ensure_api_available(
    client: &dyn ClusterClient,
    group: &str,
    version: &str,
) -> Result<StepOutcome> {
    if client.api_group_version_served(group, version).await? {
        Ok(StepOutcome::Continue)
    } else {
        Err(Error::MissingCapability {
            group_version: format!("{}/{}", group, version),
        })
    }
}
