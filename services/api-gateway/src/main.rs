//! API gateway HTTP server.

use api_gateway::{DEFAULT_LOG_FILTER, GatewayState, build_router};
use courier_amqp::AmqpConnector;
use courier_runtime::{
    BrokerLink, MetricsExporter, RelayConfig, init_tracing, load_dotenv, shutdown_signal,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_files = load_dotenv();
    init_tracing(DEFAULT_LOG_FILTER);

    let config = RelayConfig::from_env("api-gateway")?;
    info!(
        service = %config.service_name,
        exchange = %config.exchange,
        timeout = ?config.request_timeout,
        env_files = ?env_files,
        "Configuration loaded"
    );

    let metrics = if config.metrics_enabled {
        MetricsExporter::install()?
    } else {
        MetricsExporter::disabled()
    };

    let connector = AmqpConnector::builder()
        .uri(&config.rabbitmq_uri)
        .connection_name(&config.service_name)
        .build()?;
    let link = Arc::new(
        BrokerLink::new(Arc::new(connector))
            .with_connect_policy(config.connect_policy())
            .with_publish_policy(config.publish_policy()),
    );
    link.connect().await?;
    info!(endpoint = %link.endpoint(), "Broker link established");

    let shutdown = CancellationToken::new();
    let state = GatewayState::new(
        Arc::clone(&link),
        &config.exchange,
        config.request_timeout,
        shutdown.clone(),
        metrics,
    );
    let app = build_router(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    link.close().await;
    info!("Server stopped");
    Ok(())
}
