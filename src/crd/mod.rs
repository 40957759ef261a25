//! Custom Resource Definitions
//!
//! - MultiClusterHub: the hub resource this operator reconciles

pub mod multicluster_hub;

pub use multicluster_hub::*;
