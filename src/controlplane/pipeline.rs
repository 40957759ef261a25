//! Reconciliation Pipeline
//!
//! A fixed, ordered list of steps driven by a small loop. Every step returns a
//! [`StepOutcome`]: `Continue` moves on to the next step in the same pass,
//! `Requeue` ends the pass and asks to be invoked again, and `Stop` ends the
//! pass with an error. A pass therefore makes at most one state-changing call
//! on a dependent resource before handing control back to the caller.
//!
//! A hub marked for deletion skips the steps: the uninstall cleanup runs and
//! the hub finalizer is released.

use crate::crd::{MultiClusterHub, HUB_FINALIZER, INGRESS_DOMAIN_ANNOTATION};
use crate::domain::ports::{ClusterClientRef, NamespacedName, RenderContext, RendererRef};
use crate::error::{Error, Result};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::defaults::{is_fully_defaulted, set_defaults};
use super::ensure::{
    ensure_api_available, ensure_deployment, ensure_dynamic, ensure_secret, ensure_service,
};
use super::facts::{discover_ingress_domain, ClusterFacts, Fact};
use super::render::apply_rendered;
use super::resources::{channel_resource, subscription_resource, ResourceBuilder};
use super::secret::mongo_secret;
use super::status::aggregate_status;
use super::uninstall::uninstall;

/// Optional API group the cert-manager charts depend on
pub const CERT_MANAGER_GROUP: &str = "certmanager.k8s.io";

/// Version of the cert-manager API that must be served
pub const CERT_MANAGER_VERSION: &str = "v1alpha1";

// =============================================================================
// Configuration
// =============================================================================

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before the next pass when a step asks for a requeue
    pub requeue_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Steps
// =============================================================================

/// Result of one pipeline step
#[derive(Debug)]
pub enum StepOutcome {
    /// This step is converged; run the next one
    Continue,
    /// End the pass and invoke the pipeline again later
    Requeue,
    /// End the pass with an error
    Stop(Error),
}

/// Pipeline steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Defaults,
    Finalizer,
    HelmRepoDeployment,
    HelmRepoService,
    HelmChannel,
    CertManagerSubscription,
    CertManagerApi,
    CertWebhookSubscription,
    ConfigWatcherSubscription,
    MongoSecret,
    IngressDomain,
    RenderAndApply,
    Status,
}

impl Step {
    /// Every step, in the order a pass runs them
    pub const ALL: [Step; 13] = [
        Step::Defaults,
        Step::Finalizer,
        Step::HelmRepoDeployment,
        Step::HelmRepoService,
        Step::HelmChannel,
        Step::CertManagerSubscription,
        Step::CertManagerApi,
        Step::CertWebhookSubscription,
        Step::ConfigWatcherSubscription,
        Step::MongoSecret,
        Step::IngressDomain,
        Step::RenderAndApply,
        Step::Status,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Defaults => "defaults",
            Step::Finalizer => "finalizer",
            Step::HelmRepoDeployment => "helm-repo-deployment",
            Step::HelmRepoService => "helm-repo-service",
            Step::HelmChannel => "helm-channel",
            Step::CertManagerSubscription => "cert-manager-subscription",
            Step::CertManagerApi => "cert-manager-api",
            Step::CertWebhookSubscription => "cert-webhook-subscription",
            Step::ConfigWatcherSubscription => "config-watcher-subscription",
            Step::MongoSecret => "mongo-secret",
            Step::IngressDomain => "ingress-domain",
            Step::RenderAndApply => "render-and-apply",
            Step::Status => "status",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Drives one hub toward its desired state
pub struct Reconciler {
    client: ClusterClientRef,
    renderer: RendererRef,
    facts: Arc<ClusterFacts>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        client: ClusterClientRef,
        renderer: RendererRef,
        facts: Arc<ClusterFacts>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            renderer,
            facts,
            config,
        }
    }

    pub fn facts(&self) -> &ClusterFacts {
        &self.facts
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass for the hub at `key`.
    ///
    /// Returns `Ok(None)` when every step is converged (or the hub is gone),
    /// `Ok(Some(delay))` when the pass made progress and wants another run.
    /// Cancellation is observed before and during every step.
    pub async fn reconcile(
        &self,
        key: &NamespacedName,
        cancel: &CancellationToken,
    ) -> Result<Option<Duration>> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.get_hub(key) => result?,
        };
        let Some(mut hub) = fetched else {
            info!(hub = %key, "MultiClusterHub not found, nothing to reconcile");
            return Ok(None);
        };

        if hub.is_being_deleted() {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.finalize(key, &hub) => result,
            };
        }

        for step in Step::ALL {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.run_step(step, &mut hub) => result.unwrap_or_else(StepOutcome::Stop),
            };

            match outcome {
                StepOutcome::Continue => continue,
                StepOutcome::Requeue => {
                    debug!(hub = %key, step = %step, "Step requested requeue");
                    return Ok(Some(self.config.requeue_after));
                }
                StepOutcome::Stop(e) => {
                    warn!(hub = %key, step = %step, error = %e, "Reconciliation stopped");
                    return Err(e);
                }
            }
        }

        debug!(hub = %key, "Reconciliation converged");
        Ok(None)
    }

    async fn run_step(&self, step: Step, hub: &mut MultiClusterHub) -> Result<StepOutcome> {
        let client = self.client.as_ref();

        match step {
            Step::Defaults => {
                if !is_fully_defaulted(hub) {
                    set_defaults(hub, client, &self.facts).await?;
                }
                Ok(StepOutcome::Continue)
            }
            Step::Finalizer => {
                if hub.has_finalizer() {
                    return Ok(StepOutcome::Continue);
                }
                let key =
                    NamespacedName::new(hub.namespace().unwrap_or_default(), hub.name_any());
                info!(hub = %key, "Adding uninstall finalizer");
                self.client.add_hub_finalizer(&key, HUB_FINALIZER).await?;
                Ok(StepOutcome::Requeue)
            }
            Step::HelmRepoDeployment => {
                let desired = ResourceBuilder::new(hub)?.helm_repo_deployment();
                ensure_deployment(client, &desired).await
            }
            Step::HelmRepoService => {
                let desired = ResourceBuilder::new(hub)?.helm_repo_service();
                ensure_service(client, &desired).await
            }
            Step::HelmChannel => {
                let desired = ResourceBuilder::new(hub)?.helm_channel();
                ensure_dynamic(client, &channel_resource(), &desired).await
            }
            Step::CertManagerSubscription => {
                let desired = ResourceBuilder::new(hub)?.cert_manager_subscription();
                ensure_dynamic(client, &subscription_resource(), &desired).await
            }
            Step::CertManagerApi => {
                ensure_api_available(client, CERT_MANAGER_GROUP, CERT_MANAGER_VERSION).await
            }
            Step::CertWebhookSubscription => {
                let desired = ResourceBuilder::new(hub)?.cert_webhook_subscription();
                ensure_dynamic(client, &subscription_resource(), &desired).await
            }
            Step::ConfigWatcherSubscription => {
                let desired = ResourceBuilder::new(hub)?.config_watcher_subscription();
                ensure_dynamic(client, &subscription_resource(), &desired).await
            }
            Step::MongoSecret => {
                let desired = mongo_secret(hub)?;
                ensure_secret(client, &desired).await
            }
            Step::IngressDomain => self.ingress_domain(hub).await,
            Step::RenderAndApply => {
                let ctx = RenderContext {
                    ingress_domain: self.facts.ingress_domain(),
                };
                let objects = self.renderer.render(hub, &ctx)?;
                apply_rendered(client, hub, objects).await
            }
            Step::Status => aggregate_status(client, hub).await,
        }
    }

    /// Clean up after a deleted hub and release its finalizer.
    ///
    /// A hub without the finalizer was never installed by this operator or is
    /// already cleaned up. A failed cleanup keeps the finalizer so the next
    /// pass retries it.
    async fn finalize(
        &self,
        key: &NamespacedName,
        hub: &MultiClusterHub,
    ) -> Result<Option<Duration>> {
        if !hub.has_finalizer() {
            debug!(hub = %key, "Hub is being deleted, no cleanup pending");
            return Ok(None);
        }

        let ctx = RenderContext {
            ingress_domain: hub
                .ingress_domain()
                .map(str::to_string)
                .or_else(|| self.facts.ingress_domain()),
        };
        uninstall(self.client.as_ref(), self.renderer.as_ref(), hub, &ctx).await?;
        self.client.remove_hub_finalizer(key, HUB_FINALIZER).await?;
        info!(hub = %key, "Released uninstall finalizer");
        Ok(None)
    }

    /// Discover the ingress domain once per process and record it on the hub.
    ///
    /// A hub that already carries the cached domain is left alone. The cache
    /// is filled before the hub write, so a conflicting write only retries
    /// the annotation.
    async fn ingress_domain(&self, hub: &mut MultiClusterHub) -> Result<StepOutcome> {
        let domain = match self.facts.ingress_domain() {
            Some(domain) => domain,
            None => {
                let domain = discover_ingress_domain(self.client.as_ref()).await?;
                self.facts.set(Fact::IngressDomain, domain.clone());
                info!(hub = %hub.name_any(), domain = %domain, "Discovered cluster ingress domain");
                domain
            }
        };

        if hub.ingress_domain() == Some(domain.as_str()) {
            return Ok(StepOutcome::Continue);
        }

        hub.annotations_mut()
            .insert(INGRESS_DOMAIN_ANNOTATION.to_string(), domain);

        match self.client.update_hub(hub).await {
            Ok(updated) => {
                *hub = updated;
                Ok(StepOutcome::Continue)
            }
            Err(e) if e.is_conflict() => {
                debug!(hub = %hub.name_any(), "Hub update conflicted, requeueing");
                Ok(StepOutcome::Requeue)
            }
            Err(e) => Err(e),
        }
    }
}
