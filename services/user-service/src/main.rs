//! User service worker.

use courier_amqp::AmqpConnector;
use courier_runtime::{BrokerLink, RelayConfig, init_tracing, load_dotenv, shutdown_signal};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use user_service::{DEFAULT_LOG_FILTER, UserDirectory, spawn_worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_files = load_dotenv();
    init_tracing(DEFAULT_LOG_FILTER);

    let config = RelayConfig::from_env("user-service")?;
    info!(
        service = %config.service_name,
        exchange = %config.exchange,
        env_files = ?env_files,
        "Configuration loaded"
    );

    let connector = AmqpConnector::builder()
        .uri(&config.rabbitmq_uri)
        .connection_name(&config.service_name)
        .prefetch(1)
        .build()?;
    let link = Arc::new(
        BrokerLink::new(Arc::new(connector))
            .with_connect_policy(config.connect_policy())
            .with_publish_policy(config.publish_policy()),
    );
    link.connect().await?;
    info!(endpoint = %link.endpoint(), "Broker link established");

    let shutdown = CancellationToken::new();
    let worker = spawn_worker(
        Arc::clone(&link),
        &config.exchange,
        Arc::new(UserDirectory::new()),
        config.consumer_retry_delay,
        shutdown.clone(),
    )?;

    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = worker.await {
        error!(error = %e, "Worker task failed");
    }

    link.close().await;
    info!("Worker stopped");
    Ok(())
}
