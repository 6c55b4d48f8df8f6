use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kafka_pipeline::client::{KafkaConsumerClient, KafkaProducerClient};
use kafka_pipeline::config::RelayConfig;
use kafka_pipeline::relay::{Relay, RelayMode};
use kafka_pipeline::{Receiver, Sender};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Kafka relay");

    let config = RelayConfig::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let mode = config.mode()?;
    if mode == RelayMode::ExactlyOnce && config.producer.kafka_transactional_id.is_none() {
        anyhow::bail!("exactly-once relay requires KAFKA_TRANSACTIONAL_ID to be set");
    }
    let subscription = config.consumer.subscription()?;

    let consumer_config = config.kafka.consumer_client_config(&config.consumer)?;
    let consumer = KafkaConsumerClient::new(&consumer_config, &subscription)
        .context("Failed to create Kafka consumer")?;

    let producer_config = config.kafka.producer_client_config(&config.producer)?;
    let producer = Arc::new(
        KafkaProducerClient::new(&producer_config, config.producer.transaction_timeout())
            .context("Failed to create Kafka producer")?,
    );
    let sender_options = config.producer.sender_options()?;
    let sender = match mode {
        RelayMode::ExactlyOnce => Sender::transactional(producer, sender_options),
        RelayMode::AtLeastOnce | RelayMode::AtMostOnce => Sender::new(producer, sender_options),
    };

    // Polling and offset commits run apart from the workers on the main runtime
    let poll_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.relay_poll_threads.max(1))
        .thread_name("kafka-relay-poll")
        .enable_all()
        .build()
        .context("Failed to build poll runtime")?;
    let receiver = Receiver::new(
        Arc::new(consumer),
        config
            .consumer
            .receiver_options()
            .with_poll_runtime(poll_runtime.handle().clone()),
    );

    let relay = Relay::new(receiver, sender, config.relay_output_topic.clone(), mode);
    let outcome = relay
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = ?e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, shutting down gracefully...");
        })
        .await;

    // The relay waited for the receiver's tasks, and a runtime cannot be dropped
    // from async code
    poll_runtime.shutdown_background();
    outcome?;

    info!("Kafka relay stopped");
    Ok(())
}
