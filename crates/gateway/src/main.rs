//! Gateway service entry point.

use anyhow::{Context, Result};
use gateway::{create_router, Config, GatewayHandler, HandshakeDialer};
use mesh::{Container, MeshServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use naming::ConsulNaming;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wire::protocol::{SN_CHAT, SN_LOGIN};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");
    let config = Config::from_env()?;
    config.log();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let container = Container::new();
    let handler = Arc::new(GatewayHandler::new(&config.service_id, container.clone()));
    let server = MeshServer::builder(&config.listen, config.instance(), handler.clone())
        .options(config.server_options())
        .acceptor(handler.clone())
        .state_listener(handler)
        .build();

    container.init(Arc::new(server.clone()), [SN_LOGIN, SN_CHAT])?;
    container.set_naming(Arc::new(ConsulNaming::new(&config.consul_url)));
    container.set_dialer(Arc::new(HandshakeDialer::new(&config.service_id)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);
    let health = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, create_router(server)).await {
            error!("Health server error: {:?}", e);
        }
    });

    let result = container.run_until(shutdown_signal()).await;
    health.abort();
    if let Err(e) = &result {
        error!("Gateway stopped with error: {}", e);
    }
    result?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
