use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::warn;

use crate::receiver::ReceiverOptions;
use crate::relay::RelayMode;
use crate::sender::SenderOptions;
use crate::types::{Acks, IsolationLevel, OffsetReset, Subscription};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before the client stops retrying a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerSettings {
    #[envconfig(default = "256")]
    pub kafka_max_in_flight: usize,

    #[envconfig(default = "true")]
    pub kafka_stop_on_error: bool,

    #[envconfig(default = "all")]
    pub kafka_acks: String, // 0, 1, all

    #[envconfig(default = "3")]
    pub kafka_retries: u32,

    #[envconfig(default = "100")]
    pub kafka_retry_backoff_ms: u64,

    // Setting this turns the producer transactional and gives the sender a coordinator
    pub kafka_transactional_id: Option<String>,

    #[envconfig(default = "60000")]
    pub kafka_transaction_timeout_ms: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerSettings {
    pub kafka_consumer_group: String,

    // Comma separated topic list, or a regex pattern starting with ^
    pub kafka_consumer_subscription: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "read_committed")]
    pub kafka_consumer_isolation_level: String, // read_committed, read_uncommitted

    // 0 disables periodic commits
    #[envconfig(default = "5000")]
    pub kafka_consumer_commit_interval_ms: u64,

    // 0 disables batch-size commits
    #[envconfig(default = "0")]
    pub kafka_consumer_commit_batch_size: usize,

    #[envconfig(default = "5")]
    pub kafka_consumer_max_commit_attempts: u32,

    #[envconfig(default = "500")]
    pub kafka_consumer_max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout_ms: u64,

    #[envconfig(default = "1024")]
    pub kafka_consumer_receive_buffer: usize,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RelayConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub producer: ProducerSettings,

    #[envconfig(nested = true)]
    pub consumer: ConsumerSettings,

    #[envconfig(default = "at-least-once")]
    pub relay_mode: String, // at-least-once, at-most-once, exactly-once

    pub relay_output_topic: String,

    #[envconfig(default = "1")]
    pub relay_poll_threads: usize, // threads of the dedicated poll and commit runtime
}

impl RelayConfig {
    pub fn mode(&self) -> Result<RelayMode, ConfigError> {
        parse_relay_mode(&self.relay_mode)
    }
}

pub fn parse_relay_mode(value: &str) -> Result<RelayMode, ConfigError> {
    match value.trim().to_lowercase().replace('_', "-").as_str() {
        "at-least-once" => Ok(RelayMode::AtLeastOnce),
        "at-most-once" => Ok(RelayMode::AtMostOnce),
        "exactly-once" => Ok(RelayMode::ExactlyOnce),
        _ => Err(ConfigError::Invalid {
            key: "relay_mode",
            value: value.to_string(),
        }),
    }
}

pub fn parse_acks(value: &str) -> Result<Acks, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "0" | "none" => Ok(Acks::None),
        "1" | "leader" => Ok(Acks::Leader),
        "all" | "-1" => Ok(Acks::All),
        _ => Err(ConfigError::Invalid {
            key: "acks",
            value: value.to_string(),
        }),
    }
}

pub fn parse_offset_reset(value: &str) -> Result<OffsetReset, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "earliest" | "smallest" => Ok(OffsetReset::Earliest),
        "latest" | "largest" => Ok(OffsetReset::Latest),
        _ => Err(ConfigError::Invalid {
            key: "auto_offset_reset",
            value: value.to_string(),
        }),
    }
}

pub fn parse_isolation_level(value: &str) -> Result<IsolationLevel, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "read_committed" => Ok(IsolationLevel::ReadCommitted),
        "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
        _ => Err(ConfigError::Invalid {
            key: "isolation_level",
            value: value.to_string(),
        }),
    }
}

pub fn parse_subscription(value: &str) -> Result<Subscription, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Empty("subscription"));
    }
    if value.starts_with('^') {
        return Ok(Subscription::Pattern(value.to_string()));
    }

    let topics: Vec<String> = value
        .split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if topics.is_empty() {
        return Err(ConfigError::Empty("subscription"));
    }
    Ok(Subscription::Topics(topics))
}

impl ProducerSettings {
    pub fn acks(&self) -> Result<Acks, ConfigError> {
        parse_acks(&self.kafka_acks)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_transaction_timeout_ms)
    }

    pub fn sender_options(&self) -> Result<SenderOptions, ConfigError> {
        if self.kafka_max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: "max_in_flight",
                value: "0".to_string(),
            });
        }

        Ok(SenderOptions::default()
            .with_max_in_flight(self.kafka_max_in_flight)
            .with_stop_on_error(self.kafka_stop_on_error)
            .with_retries(self.kafka_retries)
            .with_retry_backoff(Duration::from_millis(self.kafka_retry_backoff_ms))
            .with_transaction_timeout(self.transaction_timeout()))
    }
}

impl ConsumerSettings {
    pub fn subscription(&self) -> Result<Subscription, ConfigError> {
        parse_subscription(&self.kafka_consumer_subscription)
    }

    pub fn offset_reset(&self) -> Result<OffsetReset, ConfigError> {
        parse_offset_reset(&self.kafka_consumer_offset_reset)
    }

    pub fn isolation_level(&self) -> Result<IsolationLevel, ConfigError> {
        parse_isolation_level(&self.kafka_consumer_isolation_level)
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions::default()
            .with_commit_interval(Duration::from_millis(
                self.kafka_consumer_commit_interval_ms,
            ))
            .with_commit_batch_size(self.kafka_consumer_commit_batch_size)
            .with_max_commit_attempts(self.kafka_consumer_max_commit_attempts)
            .with_max_poll_records(self.kafka_consumer_max_poll_records)
            .with_poll_timeout(Duration::from_millis(self.kafka_consumer_poll_timeout_ms))
            .with_receive_buffer(self.kafka_consumer_receive_buffer)
    }
}

/// rdkafka consumer configuration with the defaults every receiver relies on.
///
/// Offsets are never stored or committed by librdkafka itself: the receiver's
/// commit scheduler (or a transaction) owns every commit.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("statistics.interval.ms", "10000")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.set("auto.offset.reset", reset.as_str());
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.set("isolation.level", level.as_str());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(kafka: &KafkaConfig) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", kafka.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                kafka.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                kafka.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (kafka.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                kafka.kafka_producer_queue_messages.to_string(),
            );

        if kafka.kafka_tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        Self { config }
    }

    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.config.set("acks", acks.as_str());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.config.set("retries", retries.to_string());
        self
    }

    /// Transactions need an idempotent producer, which only accepts `acks=all`
    pub fn with_transactional_id(mut self, transactional_id: &str, timeout: Duration) -> Self {
        self.config
            .set("transactional.id", transactional_id)
            .set("enable.idempotence", "true")
            .set("acks", Acks::All.as_str())
            .set("transaction.timeout.ms", timeout.as_millis().to_string());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl KafkaConfig {
    pub fn consumer_client_config(
        &self,
        consumer: &ConsumerSettings,
    ) -> Result<ClientConfig, ConfigError> {
        Ok(
            ConsumerConfigBuilder::new(&self.kafka_hosts, &consumer.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_offset_reset(consumer.offset_reset()?)
                .with_isolation_level(consumer.isolation_level()?)
                .build(),
        )
    }

    pub fn producer_client_config(
        &self,
        producer: &ProducerSettings,
    ) -> Result<ClientConfig, ConfigError> {
        let acks = producer.acks()?;
        let mut builder = ProducerConfigBuilder::new(self)
            .with_acks(acks)
            .with_retries(producer.kafka_retries);

        if let Some(transactional_id) = &producer.kafka_transactional_id {
            if acks != Acks::All {
                warn!(
                    acks = acks.as_str(),
                    "Transactional producer requires acks=all, overriding configured acks"
                );
            }
            builder =
                builder.with_transactional_id(transactional_id, producer.transaction_timeout());
        }

        Ok(builder.build())
    }
}
