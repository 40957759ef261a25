//! Error types for the MultiClusterHub operator
//!
//! Provides structured error types for the reconciliation pipeline, cluster
//! fact discovery, manifest rendering and the controller runtime.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reconciliation cancelled")]
    Cancelled,

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Object is missing required key: {0}")]
    MissingObjectKey(&'static str),

    // =========================================================================
    // Cluster Discovery Errors
    // =========================================================================
    #[error("Failed to find default storageclass")]
    NoDefaultStorageClass,

    #[error("API {group_version} is not available in the cluster")]
    MissingCapability { group_version: String },

    #[error("Field {path} not found in {resource}")]
    FieldNotFound { resource: String, path: String },

    #[error("Field {path} in {resource} is invalid: {reason}")]
    InvalidField {
        resource: String,
        path: String,
        reason: String,
    },

    // =========================================================================
    // Rendering Errors
    // =========================================================================
    #[error("Template error: {0}")]
    Template(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Optional API still being installed - poll
            Error::MissingCapability { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Cluster facts may appear later (admin marks a default class)
            Error::NoDefaultStorageClass
            | Error::FieldNotFound { .. }
            | Error::InvalidField { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Shutting down
            Error::Cancelled => ErrorAction::NoRequeue,

            // Broken templates or config won't fix themselves
            Error::Configuration(_) | Error::Template(_) | Error::Yaml(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Io(_))
    }

    /// The API server answered 404
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// The API server answered 409: the object was modified concurrently
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    }))
}
