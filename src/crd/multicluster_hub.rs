//! MultiClusterHub CRD
//!
//! The hub resource: declares which version of the hub stack to run, where
//! its images come from, how its databases are stored and how cluster
//! provisioning (hive) is configured.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the hub resource
pub const HUB_GROUP: &str = "operators.open-cluster-management.io";

/// API version of the hub resource
pub const HUB_VERSION: &str = "v1alpha1";

/// Annotation carrying the discovered cluster ingress domain
pub const INGRESS_DOMAIN_ANNOTATION: &str = "operators.open-cluster-management.io/ingress-domain";

/// Finalizer holding hub deletion until uninstall cleanup has run
pub const HUB_FINALIZER: &str = "operators.open-cluster-management.io/uninstall";

// =============================================================================
// MultiClusterHub CRD
// =============================================================================

/// MultiClusterHub is the top-level resource reconciled by this operator.
/// Empty string fields are unset and get filled by the defaulter before any
/// dependent resource is created.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operators.open-cluster-management.io",
    version = "v1alpha1",
    kind = "MultiClusterHub",
    plural = "multiclusterhubs",
    shortname = "mch",
    status = "MultiClusterHubStatus",
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubSpec {
    /// Version of the hub components
    #[serde(default)]
    pub version: String,

    /// Repository the component images are pulled from
    #[serde(default)]
    pub image_repository: String,

    /// Pull policy applied to component images (Always, IfNotPresent, Never)
    #[serde(default)]
    pub image_pull_policy: String,

    /// Storage for the mongo database
    #[serde(default)]
    pub mongo: StorageConfig,

    /// Storage for etcd
    #[serde(default)]
    pub etcd: StorageConfig,

    /// Cluster provisioning configuration
    #[serde(default)]
    pub hive: HiveConfigSpec,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Persistent storage settings for a stateful component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Requested size (e.g., "1Gi")
    #[serde(default)]
    pub storage: String,

    /// Storage class; the cluster default class when unset
    #[serde(default)]
    pub storage_class: String,
}

/// Reference to an object in the hub's namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalReference {
    pub name: String,
}

impl LocalReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Hive cluster provisioning configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HiveConfigSpec {
    /// Extra certificate authorities trusted by provisioned clusters
    #[serde(default)]
    pub additional_certificate_authorities: Vec<LocalReference>,

    /// Behaviour when provisioning fails
    #[serde(default)]
    pub failed_provision_config: FailedProvisionConfig,

    /// Pull secret handed to every provisioned cluster
    #[serde(default)]
    pub global_pull_secret: Option<LocalReference>,
}

/// Failed provision handling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedProvisionConfig {
    /// Skip gathering logs from failed installs
    #[serde(default)]
    pub skip_gather_logs: bool,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the MultiClusterHub
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubStatus {
    /// Overall phase
    #[serde(default)]
    pub phase: HubPhase,

    /// Snapshot of every deployment in the hub namespace
    #[serde(default)]
    pub deployments: Vec<DeploymentResult>,
}

/// Hub lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HubPhase {
    #[default]
    Pending,
    Running,
}

impl std::fmt::Display for HubPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubPhase::Pending => write!(f, "Pending"),
            HubPhase::Running => write!(f, "Running"),
        }
    }
}

/// Name and status of one deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub name: String,
    pub status: DeploymentState,
}

/// Replica counters copied from a deployment's status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub unavailable_replicas: i32,
    #[serde(default)]
    pub observed_generation: i64,
}

// =============================================================================
// Helper Methods
// =============================================================================

impl MultiClusterHub {
    /// Whether deletion of the hub has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the uninstall finalizer is set
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == HUB_FINALIZER))
    }

    /// Whether the last written status reports the hub as running
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == HubPhase::Running)
            .unwrap_or(false)
    }

    /// Ingress domain persisted on the hub, if any
    pub fn ingress_domain(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INGRESS_DOMAIN_ANNOTATION))
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }
}
