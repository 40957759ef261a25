//! Desired-State Defaulter
//!
//! Normalizes an under-specified hub so every field that shapes a dependent
//! resource has a concrete value before anything is created.

use crate::controlplane::facts::{default_storage_class, ClusterFacts};
use crate::crd::{FailedProvisionConfig, HiveConfigSpec, LocalReference, MultiClusterHub};
use crate::domain::ports::ClusterClient;
use crate::error::Result;
use tracing::debug;

/// Hub version used when none is requested
pub const LATEST_VERSION: &str = "1.0.0";

/// Image repository used when none is requested
pub const DEFAULT_REPOSITORY: &str = "quay.io/open-cluster-management";

/// Image pull policy used when none is requested
pub const DEFAULT_PULL_POLICY: &str = "Always";

/// Size requested for mongo and etcd volumes when none is requested
pub const DEFAULT_STORAGE_SIZE: &str = "1Gi";

/// Hive block installed when the caller left hive entirely unset
pub fn default_hive_config() -> HiveConfigSpec {
    HiveConfigSpec {
        additional_certificate_authorities: vec![LocalReference::new("letsencrypt-ca")],
        failed_provision_config: FailedProvisionConfig {
            skip_gather_logs: true,
        },
        global_pull_secret: Some(LocalReference::new("private-secret")),
    }
}

/// Whether the hub already has every default applied.
///
/// The hive block counts as set as soon as any one of its fields is.
pub fn is_fully_defaulted(hub: &MultiClusterHub) -> bool {
    let spec = &hub.spec;
    !spec.version.is_empty()
        && !spec.image_repository.is_empty()
        && !spec.image_pull_policy.is_empty()
        && !spec.mongo.storage.is_empty()
        && !spec.mongo.storage_class.is_empty()
        && !spec.etcd.storage.is_empty()
        && !spec.etcd.storage_class.is_empty()
        && spec.hive != HiveConfigSpec::default()
}

/// Fill unset fields of the hub spec in place.
///
/// Storage classes resolve to the cluster default class; when the cluster has
/// none this fails and nothing is changed beyond the static defaults. Returns
/// whether any field was filled.
pub async fn set_defaults(
    hub: &mut MultiClusterHub,
    client: &dyn ClusterClient,
    facts: &ClusterFacts,
) -> Result<bool> {
    let spec = &mut hub.spec;
    let mut changed = false;

    changed |= fill(&mut spec.version, LATEST_VERSION);
    changed |= fill(&mut spec.image_repository, DEFAULT_REPOSITORY);
    changed |= fill(&mut spec.image_pull_policy, DEFAULT_PULL_POLICY);
    changed |= fill(&mut spec.mongo.storage, DEFAULT_STORAGE_SIZE);

    if spec.mongo.storage_class.is_empty() {
        spec.mongo.storage_class = default_storage_class(client, facts).await?;
        changed = true;
    }

    changed |= fill(&mut spec.etcd.storage, DEFAULT_STORAGE_SIZE);

    if spec.etcd.storage_class.is_empty() {
        spec.etcd.storage_class = default_storage_class(client, facts).await?;
        changed = true;
    }

    // All-or-nothing: one caller-set field keeps the whole block as given
    if spec.hive == HiveConfigSpec::default() {
        spec.hive = default_hive_config();
        changed = true;
    }

    if changed {
        debug!(spec = ?hub.spec, "Applied defaults to MultiClusterHub");
    }
    Ok(changed)
}

fn fill(field: &mut String, default: &str) -> bool {
    if field.is_empty() {
        *field = default.to_string();
        true
    } else {
        false
    }
}
