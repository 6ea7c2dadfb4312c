//! Observability Platform API Gateway
//!
//! Fronts the platform's backend services: routes by path prefix, isolates
//! failing services behind circuit breakers and publishes an event stream
//! describing every proxied exchange.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use observability_gateway::{
    build_router,
    services::{events, metrics::GatewayMetrics},
    AppState, Config, RegistryFile,
};

/// Upper bound on how long shutdown waits for queued events to be published
const PUBLISHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry file picked up when neither the flag nor the config names services
const DEFAULT_SERVICES_FILE: &str = "config/services.json";

/// Observability Platform API Gateway
#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "Request-routing API gateway with circuit breakers and event publishing")]
#[command(version)]
struct Args {
    /// Extra configuration file layered above config/
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Service registry file ({"services": [...]}), replaces configured services
    #[arg(short, long, env = "GATEWAY_SERVICES")]
    services: Option<PathBuf>,

    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let services_file = args.services.clone().or_else(|| {
        let fallback = PathBuf::from(DEFAULT_SERVICES_FILE);
        (config.services.is_empty() && fallback.exists()).then_some(fallback)
    });
    if let Some(path) = &services_file {
        config.services = RegistryFile::from_path(path)
            .with_context(|| format!("Failed to load service registry {}", path.display()))?
            .services;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    init_tracing(&config)?;

    info!(
        "Starting Observability Platform API Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Configuration loaded for environment: {}",
        config.environment
    );

    let metrics = Arc::new(GatewayMetrics::new()?);

    let (event_sender, event_receiver) = events::channel(config.event_bus.channel_capacity);
    let state = AppState::new(config.clone(), event_sender, metrics.clone())
        .context("Failed to initialize application state")?;
    info!("Application state initialized successfully");

    let publisher = events::spawn_publisher(config.event_bus.clone(), event_receiver, metrics);

    let poller = if config.health.interval_seconds > 0 {
        Some(state.health.clone().spawn_poller(
            state.registry.clone(),
            Duration::from_secs(config.health.interval_seconds),
        ))
    } else {
        None
    };

    for route in state.registry.routes() {
        info!(
            service = %route.name,
            prefix = %route.prefix,
            target = %route.target_base_url,
            "Registered service route"
        );
    }

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("API Gateway listening on {}", addr);
    info!("Health check endpoint: http://{}/health", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(poller) = poller {
        poller.abort();
    }

    // The router and its senders are gone; the publisher drains and exits
    match tokio::time::timeout(PUBLISHER_DRAIN_TIMEOUT, publisher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Event publisher task failed"),
        Err(_) => warn!("Event publisher did not drain before shutdown deadline"),
    }

    info!("API Gateway shutdown complete");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let level = &config.observability.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "observability_gateway={level},api_gateway={level},tower_http=info,axum::rejection=trace"
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            warn!("Received SIGTERM, shutting down gracefully");
        },
    }
}
