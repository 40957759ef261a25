//! MultiClusterHub Operator
//!
//! Runs the MultiClusterHub controller together with health and Prometheus
//! metrics endpoints.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multiclusterhub_operator::{
    run_controller, ClusterFacts, ControllerConfig, ControllerContext, Error, KubeClusterClient,
    MultiClusterHub, ReconcileMetrics, Reconciler, ReconcilerConfig, Result, TemplateRenderer,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MultiClusterHub Operator - reconciles MultiClusterHub resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Namespace to watch (all namespaces when empty)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    watch_namespace: String,

    /// Directory holding the manifest templates
    #[arg(long, env = "TEMPLATES_DIR", default_value = "templates")]
    templates_dir: String,

    /// Seconds to wait before the next pass when a step requests a requeue
    #[arg(long, env = "REQUEUE_SECS", default_value = "5")]
    requeue_secs: u64,

    /// Seconds between reconciliations of converged hubs
    #[arg(long, env = "RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Field manager used for server-side apply
    #[arg(long, env = "FIELD_MANAGER", default_value = "multiclusterhub-operator")]
    field_manager: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the MultiClusterHub CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            requeue_after: Duration::from_secs(self.requeue_secs),
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: Some(self.watch_namespace.clone()).filter(|ns| !ns.is_empty()),
            resync_interval: Duration::from_secs(self.resync_secs),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&MultiClusterHub::crd())?);
        return Ok(());
    }

    // Initialize logging
    init_logging(&args);

    info!("Starting MultiClusterHub Operator");
    info!("  Version: {}", multiclusterhub_operator::VERSION);
    info!("  Templates: {}", args.templates_dir);
    info!(
        "  Watch namespace: {}",
        if args.watch_namespace.is_empty() { "all" } else { &args.watch_namespace }
    );

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    let renderer = TemplateRenderer::load(&args.templates_dir)?;
    let metrics = ReconcileMetrics::register(prometheus::default_registry())?;

    let client = Client::try_default().await?;
    let cluster = KubeClusterClient::new(client.clone(), args.field_manager.clone());

    let reconciler = Reconciler::new(
        Arc::new(cluster),
        Arc::new(renderer),
        Arc::new(ClusterFacts::new()),
        args.reconciler_config(),
    );

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(ControllerContext::new(
        reconciler,
        args.controller_config(),
        Some(metrics),
        shutdown.clone(),
    ));

    // Start health server
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Stop on SIGTERM or ctrl-c
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    run_controller(client, ctx).await?;

    info!("Operator shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    }
                }
                _ => {
                    let mut response = Response::new(Body::from("not found"));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    response
                }
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
