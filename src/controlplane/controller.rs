//! MultiClusterHub Controller
//!
//! Wires the reconciliation pipeline into the kube-runtime controller: watch
//! registration, per-key serialization, error backoff and metrics.

use crate::crd::MultiClusterHub;
use crate::domain::ports::NamespacedName;
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::pipeline::Reconciler;

// =============================================================================
// Configuration
// =============================================================================

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Interval at which converged hubs are reconciled again
    pub resync_interval: Duration,
    /// First delay of the error backoff
    pub error_backoff_base: Duration,
    /// Upper bound of the error backoff
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_interval: Duration::from_secs(300),
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Prometheus metrics for reconciliations
#[derive(Clone)]
pub struct ReconcileMetrics {
    pub reconciliations: IntCounter,
    pub errors: IntCounter,
    pub requeues: IntCounter,
    pub duration: Histogram,
}

impl ReconcileMetrics {
    /// Create the metrics and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            reconciliations: IntCounter::new(
                "multiclusterhub_reconciliations_total",
                "Total number of MultiClusterHub reconciliations",
            )?,
            errors: IntCounter::new(
                "multiclusterhub_reconcile_errors_total",
                "Number of reconciliations that ended in an error",
            )?,
            requeues: IntCounter::new(
                "multiclusterhub_requeues_total",
                "Number of reconciliations that asked to be run again",
            )?,
            duration: Histogram::with_opts(HistogramOpts::new(
                "multiclusterhub_reconcile_duration_seconds",
                "Duration of MultiClusterHub reconciliations",
            ))?,
        };

        registry.register(Box::new(metrics.reconciliations.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.requeues.clone()))?;
        registry.register(Box::new(metrics.duration.clone()))?;
        Ok(metrics)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Context shared by every reconciliation
pub struct ControllerContext {
    pub reconciler: Reconciler,
    pub config: ControllerConfig,
    pub metrics: Option<ReconcileMetrics>,
    /// Per-hub error counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Cancelled on shutdown; passed down into every reconciliation
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    pub fn new(
        reconciler: Reconciler,
        config: ControllerConfig,
        metrics: Option<ReconcileMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            config,
            metrics,
            error_counts: dashmap::DashMap::new(),
            shutdown,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Run the controller until the shutdown token is cancelled
pub async fn run_controller(client: Client, ctx: Arc<ControllerContext>) -> Result<()> {
    let namespace = ctx.config.namespace.clone();

    let hubs: Api<MultiClusterHub> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let deployments: Api<Deployment> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let services: Api<Service> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let secrets: Api<Secret> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting MultiClusterHub controller"
    );

    let shutdown = ctx.shutdown.clone();

    Controller::new(hubs, Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default())
        .owns(secrets, Config::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    info!("MultiClusterHub controller stopped");
    Ok(())
}

fn hub_key(hub: &MultiClusterHub) -> NamespacedName {
    NamespacedName::new(hub.namespace().unwrap_or_default(), hub.name_any())
}

/// Reconcile one hub through the pipeline
#[instrument(skip(hub, ctx), fields(name = %hub.name_any(), namespace = hub.namespace().as_deref()))]
async fn reconcile(hub: Arc<MultiClusterHub>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let key = hub_key(&hub);
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.inc();
    }

    let result = ctx.reconciler.reconcile(&key, &ctx.shutdown).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.observe(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(requeue) => {
            ctx.error_counts.remove(&key.to_string());
            match requeue {
                Some(delay) => {
                    if let Some(ref metrics) = ctx.metrics {
                        metrics.requeues.inc();
                    }
                    Ok(Action::requeue(delay))
                }
                None => Ok(Action::requeue(ctx.config.resync_interval)),
            }
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.inc();
            }
            Err(e)
        }
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `max`
pub fn backoff_delay(retries: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retries.saturating_sub(1).min(10));
    base.saturating_mul(factor).min(max)
}

/// Map a reconciliation error to the next action
fn error_policy(hub: Arc<MultiClusterHub>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    let key = hub_key(&hub).to_string();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    match error.action() {
        ErrorAction::NoRequeue => {
            error!(hub = %key, error = %error, "Reconciliation failed, waiting for a change");
            Action::await_change()
        }
        ErrorAction::RequeueAfter(delay) => {
            warn!(hub = %key, error = %error, retry = retries, delay_secs = delay.as_secs(), "Reconciliation failed, will retry");
            Action::requeue(delay)
        }
        ErrorAction::RequeueWithBackoff => {
            let delay = backoff_delay(
                retries,
                ctx.config.error_backoff_base,
                ctx.config.error_backoff_max,
            );
            warn!(hub = %key, error = %error, retry = retries, delay_secs = delay.as_secs(), "Reconciliation failed, backing off");
            Action::requeue(delay)
        }
    }
}
