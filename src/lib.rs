//! MultiClusterHub Operator
//!
//! A Kubernetes operator that reconciles `MultiClusterHub` resources: it
//! defaults the hub spec, installs the helm repository, channel and chart
//! subscriptions the hub needs, applies rendered manifests and reports the
//! health of the result on the hub's status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    kube-runtime Controller                           │
//! │        (watches hubs + owned Deployments/Services/Secrets)           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     Reconciliation Pipeline                          │
//! │  defaults → finalizer → helm repo → channel → subscriptions →        │
//! │  secret → ingress domain → render + apply → status                   │
//! │  (deleted hub: uninstall cleanup → release finalizer)                │
//! │                                                                      │
//! │  ┌───────────────────┐  ┌───────────────────┐  ┌─────────────────┐   │
//! │  │  Cluster Facts    │  │  Template         │  │  Status         │   │
//! │  │  (storage class,  │  │  Renderer         │  │  Aggregator     │   │
//! │  │   ingress domain) │  │                   │  │                 │   │
//! │  └───────────────────┘  └───────────────────┘  └─────────────────┘   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                ClusterClient port (kube::Client adapter)             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Reconciliation pipeline, adapters and controller
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Ports the pipeline is written against
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    run_controller, ClusterFacts, ControllerConfig, ControllerContext, KubeClusterClient,
    ReconcileMetrics, Reconciler, ReconcilerConfig, TemplateRenderer,
};

pub use crd::{
    HubPhase, MultiClusterHub, MultiClusterHubSpec, MultiClusterHubStatus, StorageConfig,
};

pub use domain::ports::{ClusterClient, NamespacedName, RenderContext, Renderer};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
