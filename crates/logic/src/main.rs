//! Logic service entry point.

use anyhow::{Context, Result};
use logic::{router, Config, ServHandler};
use mesh::{Container, MeshServer, SessionStorage};
use metrics_exporter_prometheus::PrometheusBuilder;
use naming::ConsulNaming;
use std::sync::Arc;
use storage::RedisStorage;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Starting {} service", config.service_name);
    config.log();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let storage: Arc<dyn SessionStorage> = Arc::new(RedisStorage::connect(&config.redis_url).await?);
    info!("Connected to Redis");

    let container = Container::new();
    let handler = Arc::new(ServHandler::new(
        router(&config.service_name),
        Arc::new(container.clone()),
        storage,
    ));
    let server = MeshServer::builder(&config.listen, config.instance(), handler.clone())
        .acceptor(handler.clone())
        .state_listener(handler)
        .build();

    // Logic services only answer; they depend on nobody.
    container.init(Arc::new(server), Vec::<String>::new())?;
    container.set_naming(Arc::new(ConsulNaming::new(&config.consul_url)));

    if let Err(e) = container.run_until(shutdown_signal()).await {
        error!("{} stopped with error: {}", config.service_name, e);
        return Err(e.into());
    }
    info!("{} stopped", config.service_name);
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
