//! Talos Cluster Provider
//!
//! Runs the Cluster and Machine controllers alongside health and metrics
//! endpoints. Cloud clients are built once at startup and handed to the
//! provisioner registry.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use talos_cluster_provider::cloud::{InMemoryCloud, MetalHttpClient};
use talos_cluster_provider::cloud::metal_http::DEFAULT_METAL_API_URL;
use talos_cluster_provider::controller::{self, Context, KubeMachineLister};
use talos_cluster_provider::metrics::Metrics;
use talos_cluster_provider::store::{ConfigMapStore, DEFAULT_NAMESPACE};
use talos_cluster_provider::{
    ClusterActuator, CloudClients, Error, MachineActuator, ProvisionerRegistry,
    ProvisionerSettings, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Talos Cluster Provider - Cluster and Machine actuators for Talos nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace holding staged boot payloads
    #[arg(long, env = "PROVIDER_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Back every cloud with the in-process simulator
    #[arg(long, env = "SIMULATE_CLOUD")]
    simulate_cloud: bool,

    /// Bare-metal API base URL
    #[arg(long, env = "PACKET_API_URL", default_value = DEFAULT_METAL_API_URL)]
    metal_api_url: String,

    /// Bare-metal API token; enables the packet backend
    #[arg(long, env = "PACKET_AUTH_TOKEN", hide_env_values = true)]
    metal_auth_token: Option<String>,

    /// Interval between instance status checks in seconds
    #[arg(long, env = "INSTANCE_POLL_INTERVAL", default_value = "3")]
    instance_poll_interval_secs: u64,

    /// Bound on waiting for an EC2 instance to run, in seconds
    #[arg(long, env = "AWS_RUNNING_TIMEOUT", default_value = "120")]
    aws_running_timeout_secs: u64,

    /// Bound on waiting for a bare-metal device to become active, in seconds
    #[arg(long, env = "PACKET_ACTIVE_TIMEOUT", default_value = "600")]
    packet_active_timeout_secs: u64,
}

impl Args {
    fn settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            instance_poll_interval: Duration::from_secs(self.instance_poll_interval_secs),
            aws_running_timeout: Duration::from_secs(self.aws_running_timeout_secs),
            packet_active_timeout: Duration::from_secs(self.packet_active_timeout_secs),
            ..ProvisionerSettings::default()
        }
    }

    fn cloud_clients(&self) -> Result<CloudClients> {
        let mut clients = if self.simulate_cloud {
            CloudClients::simulated(Arc::new(InMemoryCloud::new()))
        } else {
            CloudClients::default()
        };
        if let Some(token) = &self.metal_auth_token {
            let metal = MetalHttpClient::new(self.metal_api_url.clone(), token.clone())?;
            clients = clients.with_metal(Arc::new(metal));
        }
        Ok(clients)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Talos Cluster Provider");
    info!("  Version: {}", talos_cluster_provider::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Simulated clouds: {}", args.simulate_cloud);

    let clients = args.cloud_clients()?;
    let configured = clients.configured();
    if configured.is_empty() {
        warn!("No cloud backend configured; every provisioning call will fail");
    } else {
        for kind in &configured {
            info!("  Backend: {}", kind);
        }
    }

    let client = kube::Client::try_default().await?;
    let registry = Arc::new(ProvisionerRegistry::new(clients, args.settings()));
    let store = Arc::new(ConfigMapStore::new(client.clone(), args.namespace.clone()));
    let lister = Arc::new(KubeMachineLister::new(client.clone()));
    let metrics = Metrics::new()?;
    let shutdown = CancellationToken::new();

    let ctx = Arc::new(Context {
        client,
        clusters: ClusterActuator::new(registry.clone(), store.clone(), lister),
        machines: MachineActuator::new(registry, store),
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Abort in-flight cloud waits on shutdown
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    info!("Starting controllers");
    controller::run(ctx).await;

    info!("Provider shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
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
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain(StatusCode::OK, "ok"),
                _ => plain(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse()?;

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

async fn run_metrics_server(addr: &str, metrics: Metrics) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to encode metrics");
                                plain(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                            }
                        },
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse()?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
