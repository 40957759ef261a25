//! Status Aggregator
//!
//! Rolls the health of every deployment in the hub's namespace up into the
//! hub's phase and writes it to the status subresource.

use crate::crd::{DeploymentResult, DeploymentState, HubPhase, MultiClusterHub, MultiClusterHubStatus};
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info};

use super::pipeline::StepOutcome;

/// Whether a deployment has as many available replicas as it wants
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    desired == available
}

/// Snapshot of one deployment's replica counters
pub fn deployment_result(deployment: &Deployment) -> DeploymentResult {
    let status = deployment.status.clone().unwrap_or_default();
    DeploymentResult {
        name: deployment.name_any(),
        status: DeploymentState {
            replicas: status.replicas.unwrap_or(0),
            ready_replicas: status.ready_replicas.unwrap_or(0),
            available_replicas: status.available_replicas.unwrap_or(0),
            updated_replicas: status.updated_replicas.unwrap_or(0),
            unavailable_replicas: status.unavailable_replicas.unwrap_or(0),
            observed_generation: status.observed_generation.unwrap_or(0),
        },
    }
}

/// Readiness of the whole set plus a per-deployment snapshot.
///
/// An empty set counts as ready.
pub fn summarize_deployments(deployments: &[Deployment]) -> (bool, Vec<DeploymentResult>) {
    let ready = deployments.iter().all(is_deployment_ready);
    let results = deployments.iter().map(deployment_result).collect();
    (ready, results)
}

/// Compute and write the hub status.
///
/// On success `hub` is replaced with the object returned by the API server.
/// A conflicting write asks for a requeue instead of failing.
pub async fn aggregate_status(
    client: &dyn ClusterClient,
    hub: &mut MultiClusterHub,
) -> Result<StepOutcome> {
    let namespace = hub
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let deployments = client.list_deployments(&namespace).await?;
    let (ready, results) = summarize_deployments(&deployments);
    let phase = if ready { HubPhase::Running } else { HubPhase::Pending };

    let previous = hub.status.as_ref().map(|s| s.phase);
    hub.status = Some(MultiClusterHubStatus {
        phase,
        deployments: results,
    });

    match client.update_hub_status(hub).await {
        Ok(updated) => {
            if previous != Some(phase) {
                info!(hub = %hub.name_any(), namespace = %namespace, phase = %phase, "Hub phase changed");
            } else {
                debug!(hub = %hub.name_any(), phase = %phase, "Hub status written");
            }
            *hub = updated;
            Ok(StepOutcome::Continue)
        }
        Err(e) if e.is_conflict() => {
            debug!(hub = %hub.name_any(), "Status write conflicted, requeueing");
            Ok(StepOutcome::Requeue)
        }
        Err(e) => Err(e),
    }
}
