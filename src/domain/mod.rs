//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) the reconciliation pipeline is
//! written against, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
