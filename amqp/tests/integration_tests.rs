//! Integration tests for [`AmqpConnector`] against a real RabbitMQ.
//!
//! These tests are marked `#[ignore]` because they need Docker for
//! testcontainers. To run explicitly:
//!
//! ```bash
//! cargo test -p courier-amqp --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use courier_amqp::AmqpConnector;
use courier_core::broker::{Channel, Connection, Connector, QueueSpec};
use courier_core::CorrelationId;
use courier_runtime::{BrokerLink, Correlator};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio_util::sync::CancellationToken;

const EXCHANGE: &str = "events_exchange";
const AMQP_PORT: u16 = 5672;

async fn start_rabbit() -> (ContainerAsync<RabbitMq>, AmqpConnector) {
    let rabbit = RabbitMq::default()
        .start()
        .await
        .expect("Failed to start RabbitMQ container");
    let host = rabbit.get_host().await.expect("Failed to get host");
    let port = rabbit
        .get_host_port_ipv4(AMQP_PORT)
        .await
        .expect("Failed to get port");

    let connector = AmqpConnector::builder()
        .uri(format!("amqp://guest:guest@{host}:{port}/%2f"))
        .connection_name("courier-integration")
        .build()
        .expect("valid uri");

    for attempt in 1..=60 {
        if let Ok(connection) = connector.connect().await {
            let _ = connection.close().await;
            return (rabbit, connector);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "RabbitMQ failed to become ready");
    }
    unreachable!("loop returns or panics")
}

#[tokio::test]
#[ignore]
async fn publish_and_consume_round_trip() {
    let (_rabbit, connector) = start_rabbit().await;
    let connection = connector.connect().await.expect("connect");
    let channel = connection.create_channel().await.expect("channel");

    channel.declare_exchange(EXCHANGE).await.expect("exchange");
    let queue = channel
        .declare_queue(&QueueSpec::durable("user-service_queue"))
        .await
        .expect("queue");
    channel
        .bind_queue(&queue, EXCHANGE, "GetProfile")
        .await
        .expect("bind");
    let mut deliveries = channel.consume(&queue).await.expect("consume");

    channel
        .publish(EXCHANGE, "GetProfile", br#"{"id":"u-1"}"#)
        .await
        .expect("confirmed publish");

    let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.next())
        .await
        .expect("delivery in time")
        .expect("stream open")
        .expect("delivery ok");
    assert_eq!(delivery.routing_key, "GetProfile");
    assert_eq!(delivery.body, br#"{"id":"u-1"}"#);
    delivery.ack().await.expect("ack");

    channel.close().await.expect("close channel");
    channel.close().await.expect("second close is a no-op");
    connection.close().await.expect("close connection");
    assert!(!connection.is_open());
}

#[tokio::test]
#[ignore]
async fn ephemeral_queue_is_broker_named() {
    let (_rabbit, connector) = start_rabbit().await;
    let connection = connector.connect().await.expect("connect");
    let channel = connection.create_channel().await.expect("channel");

    let queue = channel
        .declare_queue(&QueueSpec::ephemeral())
        .await
        .expect("queue");
    assert!(queue.starts_with("amq.gen-"));
}

#[tokio::test]
#[ignore]
async fn correlator_gets_reply_from_worker() {
    let (_rabbit, connector) = start_rabbit().await;
    let link = Arc::new(BrokerLink::new(Arc::new(connector)));
    let correlator = Correlator::on_exchange(Arc::clone(&link), EXCHANGE);

    let commands = link.open_channel().await.expect("channel");
    commands.declare_exchange(EXCHANGE).await.expect("exchange");
    let queue = commands
        .declare_queue(&QueueSpec::durable("user-service_queue"))
        .await
        .expect("queue");
    commands
        .bind_queue(&queue, EXCHANGE, "GetProfile")
        .await
        .expect("bind");
    let mut inbox = commands.consume(&queue).await.expect("consume");

    let responder = correlator.publisher().clone();
    let worker = tokio::spawn(async move {
        let delivery = inbox.next().await.expect("command").expect("ok");
        let command = courier_core::EventEnvelope::from_bytes(&delivery.body).expect("envelope");
        delivery.ack().await.expect("ack");
        responder
            .publish_correlated(
                "GetProfileSuccess",
                &command.correlation_id,
                &json!({ "id": command.payload["id"], "email": "ada@example.com" }),
            )
            .await
            .expect("reply");
    });

    let correlation_id = CorrelationId::new();
    let reply = correlator
        .request_correlated(
            correlation_id.clone(),
            "GetProfile",
            &["GetProfileSuccess", "GetProfileFailed"],
            &json!({ "id": "u-1" }),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .expect("reply");

    worker.await.expect("worker");
    assert_eq!(reply.correlation_id, correlation_id);
    assert_eq!(reply.payload["email"], "ada@example.com");
    link.close().await;
}
