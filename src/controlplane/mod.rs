//! Hub Control Plane Module
//!
//! The reconciliation pipeline for MultiClusterHub resources and everything
//! it drives: defaulting, cluster fact discovery, dependent resources,
//! manifest rendering, status aggregation, uninstall cleanup and the
//! controller runtime.

pub mod controller;
pub mod defaults;
pub mod ensure;
pub mod facts;
pub mod kube_client;
pub mod pipeline;
pub mod render;
pub mod resources;
pub mod secret;
pub mod status;
pub mod uninstall;

#[cfg(test)]
pub(crate) mod fake;

pub use controller::{run_controller, ControllerConfig, ControllerContext, ReconcileMetrics};
pub use facts::{ClusterFacts, Fact};
pub use kube_client::KubeClusterClient;
pub use pipeline::{Reconciler, ReconcilerConfig, Step, StepOutcome};
pub use render::TemplateRenderer;
