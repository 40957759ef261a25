//! Uninstall Cleanup
//!
//! Runs while the hub finalizer holds a deleted hub. Owner references only
//! reach objects in the hub's namespace, so the CRDs installed by the
//! cert-manager charts and rendered objects outside that namespace are
//! deleted here. The chart subscriptions, the channel and the helm repo go
//! first so the charts are uninstalled while their source still exists.

use crate::crd::MultiClusterHub;
use crate::domain::ports::{ClusterClient, NamespacedName, RenderContext, Renderer};
use crate::error::Result;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::resources::{APPS_GROUP, APPS_VERSION, HELM_CHANNEL_NAME, HELM_REPO_NAME};

/// Chart subscriptions created for every hub
pub const CHART_SUBSCRIPTIONS: [&str; 3] = [
    "cert-manager-sub",
    "cert-manager-webhook-sub",
    "configmap-watcher-sub",
];

/// CRDs the cert-manager charts install cluster-wide
pub const CERT_MANAGER_CRDS: [&str; 5] = [
    "certificates.certmanager.k8s.io",
    "issuers.certmanager.k8s.io",
    "clusterissuers.certmanager.k8s.io",
    "orders.certmanager.k8s.io",
    "challenges.certmanager.k8s.io",
];

/// Bare object naming `key` as an instance of `gvk`, enough to delete it.
/// An empty namespace leaves the object cluster-scoped.
pub fn new_unstructured(key: &NamespacedName, gvk: &GroupVersionKind) -> DynamicObject {
    let mut obj = DynamicObject::new(&key.name, &ApiResource::from_gvk(gvk));
    if !key.namespace.is_empty() {
        obj.metadata.namespace = Some(key.namespace.clone());
    }
    obj
}

/// Fixed set of objects removed when a hub in `namespace` is uninstalled,
/// in deletion order
pub fn uninstall_list(namespace: &str) -> Vec<DynamicObject> {
    let subscription = GroupVersionKind::gvk(APPS_GROUP, APPS_VERSION, "Subscription");
    let channel = GroupVersionKind::gvk(APPS_GROUP, APPS_VERSION, "Channel");
    let deployment = GroupVersionKind::gvk("apps", "v1", "Deployment");
    let crd = GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition");

    let mut objects: Vec<DynamicObject> = CHART_SUBSCRIPTIONS
        .iter()
        .map(|name| new_unstructured(&NamespacedName::new(namespace, *name), &subscription))
        .collect();
    objects.push(new_unstructured(
        &NamespacedName::new(namespace, HELM_CHANNEL_NAME),
        &channel,
    ));
    objects.push(new_unstructured(
        &NamespacedName::new(namespace, HELM_REPO_NAME),
        &deployment,
    ));
    objects.extend(
        CERT_MANAGER_CRDS
            .iter()
            .map(|name| new_unstructured(&NamespacedName::new("", *name), &crd)),
    );
    objects
}

/// Rendered objects the hub cannot own. A render failure is logged and
/// skips them, so a broken template never blocks deletion.
fn unowned_rendered(
    renderer: &dyn Renderer,
    hub: &MultiClusterHub,
    ctx: &RenderContext,
) -> Vec<DynamicObject> {
    let hub_namespace = hub.namespace();
    match renderer.render(hub, ctx) {
        Ok(objects) => objects
            .into_iter()
            .filter(|o| o.metadata.namespace.is_none() || o.metadata.namespace != hub_namespace)
            .collect(),
        Err(e) => {
            warn!(hub = %hub.name_any(), error = %e, "Failed to render manifests for cleanup");
            Vec::new()
        }
    }
}

/// Delete everything garbage collection will not reach for `hub`.
///
/// Missing objects are skipped. Returns the number of objects deleted; the
/// first failing delete aborts the cleanup.
pub async fn uninstall(
    client: &dyn ClusterClient,
    renderer: &dyn Renderer,
    hub: &MultiClusterHub,
    ctx: &RenderContext,
) -> Result<usize> {
    let namespace = hub.namespace().unwrap_or_default();
    let mut targets = uninstall_list(&namespace);
    targets.extend(unowned_rendered(renderer, hub, ctx));

    let mut deleted = 0;
    for obj in &targets {
        if client.delete(obj).await? {
            deleted += 1;
        } else {
            debug!(name = %obj.name_any(), "Nothing to delete");
        }
    }

    info!(hub = %hub.name_any(), namespace = %namespace, deleted, "Uninstalled hub");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::fake::{test_hub, FakeCluster, StaticRenderer};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn kind_of(obj: &DynamicObject) -> (&str, &str) {
        let types = obj.types.as_ref().unwrap();
        (types.api_version.as_str(), types.kind.as_str())
    }

    #[test]
    fn test_new_unstructured() {
        let sub = new_unstructured(
            &NamespacedName::new("test", "topology-sub"),
            &GroupVersionKind::gvk("apps.open-cluster-management.io", "v1", "Subscription"),
        );
        assert_eq!(kind_of(&sub), ("apps.open-cluster-management.io/v1", "Subscription"));
        assert_eq!(sub.name_any(), "topology-sub");
        assert_eq!(sub.namespace().as_deref(), Some("test"));

        let deployment = new_unstructured(
            &NamespacedName::new("test", "ocm-webhook"),
            &GroupVersionKind::gvk("apps", "v1", "Deployment"),
        );
        assert_eq!(kind_of(&deployment), ("apps/v1", "Deployment"));

        let crd = new_unstructured(
            &NamespacedName::new("", "searchcollectors.agent.open-cluster-management.io"),
            &GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
        );
        assert_eq!(kind_of(&crd), ("apiextensions.k8s.io/v1", "CustomResourceDefinition"));
        assert!(crd.namespace().is_none());
    }

    #[test]
    fn test_uninstall_list_order() {
        let objects = uninstall_list("ns");
        let kinds: Vec<_> = objects.iter().map(|o| kind_of(o).1).collect();

        assert_eq!(
            &kinds[..5],
            ["Subscription", "Subscription", "Subscription", "Channel", "Deployment"]
        );
        assert!(kinds[5..].iter().all(|k| *k == "CustomResourceDefinition"));
        assert_eq!(objects.len(), 5 + CERT_MANAGER_CRDS.len());
        for obj in &objects[..5] {
            assert_eq!(obj.namespace().as_deref(), Some("ns"));
        }
        for obj in &objects[5..] {
            assert!(obj.namespace().is_none());
        }
    }

    #[tokio::test]
    async fn test_uninstall_removes_crds_and_cluster_scoped_output() {
        let cluster = FakeCluster::new();
        let hub = test_hub("ns", "hub");
        let crd_kind =
            GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
        for name in CERT_MANAGER_CRDS {
            cluster
                .apply(&new_unstructured(&NamespacedName::new("", name), &crd_kind))
                .await
                .unwrap();
        }
        let mut role = new_unstructured(
            &NamespacedName::new("", "hub-reader"),
            &GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        )
        .data(json!({ "rules": [] }));
        role.metadata.namespace = Some(String::new());
        cluster.apply(&role).await.unwrap();
        let renderer = StaticRenderer::new(vec![role]);

        let deleted = uninstall(&cluster, &renderer, &hub, &RenderContext::default())
            .await
            .unwrap();

        assert_eq!(deleted, CERT_MANAGER_CRDS.len() + 1);
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_uninstall_skips_missing_objects() {
        let cluster = FakeCluster::new();
        let hub = test_hub("ns", "hub");

        let renderer = StaticRenderer::empty();

        let deleted = uninstall(&cluster, &renderer, &hub, &RenderContext::default())
            .await
            .unwrap();

        assert_eq!(deleted, 0);
        assert_eq!(cluster.calls("delete"), uninstall_list("ns").len());
    }

    #[tokio::test]
    async fn test_uninstall_stops_on_delete_failure() {
        let cluster = FakeCluster::new();
        cluster.fail_op("delete");
        let hub = test_hub("ns", "hub");

        let result =
            uninstall(&cluster, &StaticRenderer::empty(), &hub, &RenderContext::default()).await;

        assert_matches!(result, Err(Error::Kube(_)));
        assert_eq!(cluster.calls("delete"), 1);
    }
}
