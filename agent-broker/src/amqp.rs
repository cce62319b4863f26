//! AMQP 0-9-1 broker backed by `lapin`
//!
//! One `AmqpBroker` owns a single connection. Every consumer opens its own
//! channel on that connection, declares the topology, and sets its prefetch
//! credit with `basic.qos` before consuming.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::delivery::{Acknowledger, Delivery};
use crate::error::{BrokerError, Result};
use crate::{Broker, Consumer, ConsumerOptions, QueueStatus, Topology, redact_url};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

/// Broker reached over AMQP 0-9-1
pub struct AmqpBroker {
    connection: Connection,
    topology: Topology,
    publisher: OnceCell<Channel>,
    display_url: String,
}

impl AmqpBroker {
    /// Connects to the broker at `uri`
    ///
    /// The topology is declared lazily, on every channel that uses it.
    pub async fn connect(uri: &str, topology: Topology) -> Result<Self> {
        let display_url = redact_url(uri);
        info!(broker = %display_url, "connecting to AMQP broker");

        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        info!(broker = %display_url, "connected to AMQP broker");

        Ok(Self {
            connection,
            topology,
            publisher: OnceCell::new(),
            display_url,
        })
    }

    /// Declares the exchange, the queue and their binding on `channel`
    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        let topology = &self.topology;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: topology.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let mut arguments = FieldTable::default();
        if let Some(dlx) = &topology.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }

        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: topology.durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publisher(&self) -> Result<&Channel> {
        self.publisher
            .get_or_try_init(|| async {
                let channel = self.connection.create_channel().await?;
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await?;
                self.declare_topology(&channel).await?;
                Ok::<_, BrokerError>(channel)
            })
            .await
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_consumer(&self, options: ConsumerOptions) -> Result<Box<dyn Consumer>> {
        if !self.connection.status().connected() {
            return Err(BrokerError::Closed);
        }

        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await?;
        self.declare_topology(&channel).await?;

        let consumer = channel
            .basic_consume(
                &self.topology.queue,
                &options.tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            consumer = %options.tag,
            channel = channel.id(),
            prefetch = options.prefetch,
            "opened AMQP consumer"
        );

        Ok(Box::new(AmqpConsumer {
            channel,
            consumer,
            tag: options.tag,
        }))
    }

    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let channel = self.publisher().await?;

        let confirmation = channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishRefused);
        }

        Ok(())
    }

    async fn queue_status(&self) -> Result<QueueStatus> {
        let channel = self.connection.create_channel().await?;
        let queue = channel
            .queue_declare(
                &self.topology.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let status = QueueStatus {
            messages: queue.message_count(),
            consumers: queue.consumer_count(),
        };

        if let Err(e) = channel.close(200, "status done").await {
            warn!("Failed to close status channel: {}", e);
        }

        Ok(status)
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "agent shutdown").await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.display_url.clone()
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    tag: String,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        match self.consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(delivery)) => Ok(Some(Delivery::new(
                delivery.delivery_tag,
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker {
                    acker: delivery.acker,
                }),
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "consumer shutdown").await?;
        }
        Ok(())
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, tag: u64) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| settlement_error(tag, e))
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| settlement_error(tag, e))
    }
}

/// Keeps lost channels distinguishable from refused settlements
fn settlement_error(tag: u64, err: lapin::Error) -> BrokerError {
    let err = BrokerError::Amqp(err);
    if err.is_connection_lost() {
        err
    } else {
        BrokerError::Settlement {
            tag,
            reason: err.to_string(),
        }
    }
}
