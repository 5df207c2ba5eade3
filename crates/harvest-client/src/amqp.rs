//! RabbitMQ transport for [`Broker`].
//!
//! Topology for a queue named `jobs`:
//!
//! * `jobs`: durable, priority-enabled, with a message TTL; expired and
//!   rejected messages go to the `jobs.dlx` exchange.
//! * `jobs.dead`: bound to `jobs.dlx`; also receives explicit dead letters.
//! * `jobs.retry`: holds delayed publishes. Each message carries its delay as
//!   a per-message expiration and dead-letters back into `jobs` when it
//!   expires.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use harvest_core::error::AppError;
use harvest_core::job::{InstitutionType, Job};
use harvest_core::models::DeadLetter;
use harvest_core::traits::{Broker, Delivery};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, BasicRecoverOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

const PERSISTENT: u8 = 2;

fn broker_err(context: &str, e: lapin::Error) -> AppError {
    AppError::BrokerError(format!("{context}: {e}"))
}

/// Queue names derived from one base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub main: String,
    pub dead_letter_exchange: String,
    pub dead: String,
    pub retry: String,
}

impl QueueTopology {
    pub fn new(queue: &str) -> Self {
        Self {
            main: queue.to_string(),
            dead_letter_exchange: format!("{queue}.dlx"),
            dead: format!("{queue}.dead"),
            retry: format!("{queue}.retry"),
        }
    }

    /// Per-class queue, e.g. `harvest.jobs.federal_lab`.
    pub fn for_class(base: &str, institution_type: InstitutionType) -> Self {
        Self::new(&format!("{base}.{}", institution_type.class()))
    }
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub queue: String,
    pub prefetch: u16,
    pub max_priority: u8,
    /// Messages older than this are dead-lettered unconsumed.
    pub message_ttl: Duration,
    pub consumer_tag: String,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: queue.into(),
            prefetch: 2,
            max_priority: 10,
            message_ttl: Duration::from_secs(24 * 3600),
            consumer_tag: "harvest".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Channel,
    consumer: Arc<Mutex<Consumer>>,
    topology: QueueTopology,
}

impl AmqpBroker {
    /// Connect, declare the topology and start consuming the main queue.
    pub async fn connect(config: &AmqpConfig) -> Result<Self, AppError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| broker_err("AMQP connect failed", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_err("AMQP channel failed", e))?;
        channel
            .basic_qos(config.prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| broker_err("basic_qos failed", e))?;

        let topology = QueueTopology::new(&config.queue);
        declare_topology(&channel, &topology, config).await?;

        let consumer = channel
            .basic_consume(
                &topology.main,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("basic_consume failed", e))?;

        info!(queue = %topology.main, prefetch = config.prefetch, "AMQP broker connected");
        Ok(Self {
            connection: Arc::new(connection),
            channel,
            consumer: Arc::new(Mutex::new(consumer)),
            topology,
        })
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    pub async fn close(&self) -> Result<(), AppError> {
        self.connection
            .close(200, "consumer shutdown")
            .await
            .map_err(|e| broker_err("AMQP close failed", e))
    }

    async fn send(&self, routing_key: &str, body: &[u8], properties: BasicProperties) -> Result<(), AppError> {
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| broker_err("basic_publish failed", e))?
            .await
            .map_err(|e| broker_err("publish confirm failed", e))?;
        Ok(())
    }
}

fn json_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_delivery_mode(PERSISTENT)
}

async fn declare_topology(
    channel: &Channel,
    topology: &QueueTopology,
    config: &AmqpConfig,
) -> Result<(), AppError> {
    let durable = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            &topology.dead_letter_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_err("DLX declare failed", e))?;

    let mut main_args = FieldTable::default();
    main_args.insert(
        ShortString::from("x-max-priority"),
        AMQPValue::LongInt(i32::from(config.max_priority)),
    );
    main_args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongLongInt(config.message_ttl.as_millis() as i64),
    );
    main_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(topology.dead_letter_exchange.as_str())),
    );
    main_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(topology.dead.as_str())),
    );
    channel
        .queue_declare(&topology.main, durable, main_args)
        .await
        .map_err(|e| broker_err("main queue declare failed", e))?;

    channel
        .queue_declare(&topology.dead, durable, FieldTable::default())
        .await
        .map_err(|e| broker_err("dead-letter queue declare failed", e))?;
    channel
        .queue_bind(
            &topology.dead,
            &topology.dead_letter_exchange,
            &topology.dead,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_err("dead-letter bind failed", e))?;

    let mut retry_args = FieldTable::default();
    retry_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from("")),
    );
    retry_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(topology.main.as_str())),
    );
    channel
        .queue_declare(&topology.retry, durable, retry_args)
        .await
        .map_err(|e| broker_err("retry queue declare failed", e))?;

    Ok(())
}

impl Broker for AmqpBroker {
    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(broker_err("AMQP delivery failed", e)),
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            })),
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), AppError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| broker_err("basic_ack failed", e))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), AppError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| broker_err("basic_nack failed", e))
    }

    async fn publish(&self, job: &Job, delay: Duration, priority: u8) -> Result<(), AppError> {
        let body = job.to_message()?;
        let properties = json_properties().with_priority(priority);
        if delay.is_zero() {
            return self.send(&self.topology.main, &body, properties).await;
        }
        // Priority is kept so the job sorts correctly once it reaches the main queue.
        let expiration = delay.as_millis().max(1).to_string();
        debug!(job_id = %job.id, delay_ms = %expiration, "Publishing delayed job");
        self.send(
            &self.topology.retry,
            &body,
            properties.with_expiration(ShortString::from(expiration)),
        )
        .await
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), AppError> {
        let body = letter.to_message()?;
        self.send(&self.topology.dead, &body, json_properties()).await
    }

    async fn recover(&self) -> Result<(), AppError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
            .map_err(|e| broker_err("basic_recover failed", e))
    }
}
