//! `lapin`-backed connector and session.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerConfig;

use super::BrokerError;
use super::connection::{Connector, LossNotifier, Session};

const CLOSE_REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: Arc<BrokerConfig>,
}

impl AmqpConnector {
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self { config }
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(dlx) = &self.config.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }
        args
    }

    /// Fanout DLX plus a durable queue behind it, so rejected deliveries keep
    /// their original routing key and are never discarded by the broker.
    async fn declare_dead_letter(&self, channel: &Channel, dlx: &str, dlq: &str) -> Result<(), lapin::Error> {
        channel
            .exchange_declare(
                dlx,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                dlq,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(dlq, dlx, "", QueueBindOptions::default(), FieldTable::default())
            .await?;
        debug!(exchange = dlx, queue = dlq, "dead-letter topology declared");
        Ok(())
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<(), BrokerError> {
        let cfg = &self.config;
        let topology = |e: lapin::Error| BrokerError::Topology(e.to_string());

        if let (Some(dlx), Some(dlq)) = (&cfg.dead_letter_exchange, cfg.dead_letter_queue()) {
            self.declare_dead_letter(channel, dlx, &dlq).await.map_err(topology)?;
        }

        channel
            .exchange_declare(
                &cfg.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;

        channel
            .queue_declare(
                &cfg.queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                self.queue_arguments(),
            )
            .await
            .map_err(topology)?;

        channel
            .queue_bind(
                &cfg.queue,
                &cfg.exchange,
                &cfg.inbound_binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;

        channel
            .basic_qos(cfg.prefetch, BasicQosOptions::default())
            .await
            .map_err(topology)?;

        debug!(
            exchange = %cfg.exchange,
            queue = %cfg.queue,
            binding = %cfg.inbound_binding_key,
            prefetch = cfg.prefetch,
            dead_letter_exchange = cfg.dead_letter_exchange.as_deref().unwrap_or("-"),
            "topology declared"
        );
        Ok(())
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    #[instrument(skip(self, loss), fields(vhost = %self.config.vhost, generation = loss.generation()))]
    async fn connect(&self, loss: LossNotifier) -> Result<AmqpSession, BrokerError> {
        let connection = Connection::connect(&self.config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let on_conn_error = loss.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "broker connection error");
            on_conn_error.notify();
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let on_channel_error = loss.clone();
        channel.on_error(move |err| {
            warn!(error = %err, "broker channel error");
            on_channel_error.notify();
        });

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        self.declare_topology(&channel).await?;
        info!(exchange = %self.config.exchange, queue = %self.config.queue, "amqp session ready");

        Ok(AmqpSession {
            connection,
            channel,
            config: self.config.clone(),
            loss,
        })
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    config: Arc<BrokerConfig>,
    loss: LossNotifier,
}

impl AmqpSession {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn loss_notifier(&self) -> LossNotifier {
        self.loss.clone()
    }

    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    /// Publish a persistent JSON message to the topic exchange and wait for the
    /// broker confirmation.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirmation, lapin::Error> {
        self.channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn close(&self) {
        if let Err(err) = self.channel.close(CLOSE_REPLY_SUCCESS, "worker shutdown").await {
            debug!(error = %err, "channel close failed");
        }
        if let Err(err) = self.connection.close(CLOSE_REPLY_SUCCESS, "worker shutdown").await {
            debug!(error = %err, "connection close failed");
        }
    }
}
