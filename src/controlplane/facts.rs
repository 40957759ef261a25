//! Cluster Fact Cache
//!
//! Values that are expensive or impossible to derive from the hub resource
//! alone: the cluster's default storage class and its ingress domain. They are
//! discovered lazily, cached for the life of the process and shared by every
//! reconciliation.

use crate::domain::ports::{ClusterClient, GroupVersionResource};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Annotation that marks a storage class as the cluster default
pub const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Name of the cluster-scoped ingress configuration object
pub const INGRESS_CONFIG_NAME: &str = "cluster";

/// Field path of the domain inside the ingress configuration
pub const INGRESS_DOMAIN_PATH: [&str; 2] = ["spec", "domain"];

/// The OpenShift ingress configuration resource
pub fn ingress_config_resource() -> GroupVersionResource {
    GroupVersionResource::new("config.openshift.io", "v1", "ingresses")
}

// =============================================================================
// Fact Keys
// =============================================================================

/// A cached cluster fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fact {
    IngressDomain,
    StorageClass,
}

impl std::fmt::Display for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fact::IngressDomain => write!(f, "ingressDomain"),
            Fact::StorageClass => write!(f, "storageClass"),
        }
    }
}

// =============================================================================
// Cluster Facts
// =============================================================================

/// Process-wide cache of discovered cluster facts
///
/// Reads vastly outnumber writes. A populated fact is never replaced by an
/// empty value, and nothing is ever evicted.
#[derive(Debug, Default)]
pub struct ClusterFacts {
    facts: RwLock<HashMap<Fact, String>>,
}

impl ClusterFacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached fact
    pub fn get(&self, fact: Fact) -> Option<String> {
        self.facts.read().get(&fact).cloned()
    }

    /// Cache a fact. Empty values are ignored; returns whether the value was stored.
    pub fn set(&self, fact: Fact, value: impl Into<String>) -> bool {
        let value = value.into();
        if value.is_empty() {
            return false;
        }
        debug!(fact = %fact, value = %value, "Caching cluster fact");
        self.facts.write().insert(fact, value);
        true
    }

    pub fn contains(&self, fact: Fact) -> bool {
        self.facts.read().contains_key(&fact)
    }

    pub fn ingress_domain(&self) -> Option<String> {
        self.get(Fact::IngressDomain)
    }

    pub fn storage_class(&self) -> Option<String> {
        self.get(Fact::StorageClass)
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Resolve the cluster's default storage class, consulting the cache first
pub async fn default_storage_class(
    client: &dyn ClusterClient,
    facts: &ClusterFacts,
) -> Result<String> {
    if let Some(class) = facts.storage_class() {
        return Ok(class);
    }
    let class = discover_default_storage_class(client).await?;
    facts.set(Fact::StorageClass, class.clone());
    Ok(class)
}

/// Find the first storage class annotated as the cluster default
pub async fn discover_default_storage_class(client: &dyn ClusterClient) -> Result<String> {
    let classes = client.list_storage_classes().await?;

    classes
        .iter()
        .find(|sc| {
            sc.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(DEFAULT_STORAGE_CLASS_ANNOTATION))
                .map(|v| v == "true")
                .unwrap_or(false)
        })
        .and_then(|sc| sc.metadata.name.clone())
        .map(|name| {
            info!(storage_class = %name, "Discovered default storage class");
            name
        })
        .ok_or(Error::NoDefaultStorageClass)
}

/// Read the cluster ingress domain from the ingress configuration object
///
/// Transport failures, a missing configuration object and a missing or
/// non-string `spec.domain` are all reported as distinct errors.
pub async fn discover_ingress_domain(client: &dyn ClusterClient) -> Result<String> {
    let gvr = ingress_config_resource();

    let config = client
        .get_dynamic(&gvr, None, INGRESS_CONFIG_NAME)
        .await?
        .ok_or_else(|| Error::ResourceNotFound {
            kind: gvr.group_resource(),
            name: INGRESS_CONFIG_NAME.to_string(),
        })?;

    match nested_str(&config.data, &INGRESS_DOMAIN_PATH) {
        FieldLookup::Found(domain) => Ok(domain.to_string()),
        FieldLookup::Missing => Err(Error::FieldNotFound {
            resource: gvr.group_resource(),
            path: INGRESS_DOMAIN_PATH.join("."),
        }),
        FieldLookup::WrongType(found) => Err(Error::InvalidField {
            resource: gvr.group_resource(),
            path: INGRESS_DOMAIN_PATH.join("."),
            reason: format!("expected string, found {}", found),
        }),
    }
}

// =============================================================================
// Field Extraction
// =============================================================================

/// Result of looking up a field by path in untyped object content
#[derive(Debug, PartialEq, Eq)]
pub enum FieldLookup<'a> {
    Found(&'a str),
    Missing,
    /// Present but not a string; carries the JSON type name
    WrongType(&'static str),
}

/// Walk `path` through nested maps and expect a string at the end
pub fn nested_str<'a>(content: &'a Value, path: &[&str]) -> FieldLookup<'a> {
    let mut current = content;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return FieldLookup::Missing,
        }
    }
    match current {
        Value::String(s) => FieldLookup::Found(s),
        Value::Null => FieldLookup::Missing,
        Value::Bool(_) => FieldLookup::WrongType("bool"),
        Value::Number(_) => FieldLookup::WrongType("number"),
        Value::Array(_) => FieldLookup::WrongType("array"),
        Value::Object(_) => FieldLookup::WrongType("object"),
    }
}
