// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{
    AmqpChannel, AmqpConnector, BrokerSession, ChannelEvent, DeclaredQueue, DeliverySink,
    ExchangeAlgorithm, ExchangeOptions, PublishProperties, QueueOptions, RawDelivery,
    ReturnedMessage,
};

/// Opens real broker connections through lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

fn exchange_kind(algorithm: ExchangeAlgorithm) -> ExchangeKind {
    match algorithm {
        ExchangeAlgorithm::Direct => ExchangeKind::Direct,
        ExchangeAlgorithm::Fanout => ExchangeKind::Fanout,
        ExchangeAlgorithm::Topic => ExchangeKind::Topic,
        ExchangeAlgorithm::Headers => ExchangeKind::Headers,
    }
}

fn exchange_declare_options(options: &ExchangeOptions) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: options.durable,
        auto_delete: options.auto_delete,
        internal: options.internal,
        ..ExchangeDeclareOptions::default()
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dlx) = &options.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    if let Some(key) = &options.dead_letter_routing_key {
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(key.as_str())),
        );
    }
    arguments
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from("application/json"))
        .with_priority(properties.priority);
    if let Some(correlation_id) = &properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(expiration) = properties.expiration_ms {
        props = props.with_expiration(ShortString::from(expiration.to_string()));
    }
    props
}

fn raw_delivery(delivery: Delivery, consumer_tag: &str) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: delivery.properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
        priority: *delivery.properties.priority(),
        body: delivery.data,
    }
}

/// Turns a broker confirmation into a returned-message event or an error.
fn settle_confirmation(
    confirmation: Confirmation,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> Result<()> {
    let nacked = confirmation.is_nack();
    if let Some(returned) = confirmation.take_message() {
        let delivery = returned.delivery;
        let message = ReturnedMessage {
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.as_str().to_string(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            reply_to: delivery.properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
            body: delivery.data,
        };
        let _ = events.send(ChannelEvent::Returned(message));
    }
    if nacked {
        return Err(RabbitMQError::PublishError(
            "broker negatively acknowledged the message".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, uri: &str, prefetch: u16) -> Result<BrokerSession> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to enable confirms: {}", e)))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        connection.on_error(move |err| {
            let _ = tx.send(ChannelEvent::Closed {
                reason: format!("connection error: {}", err),
            });
        });
        let tx = events_tx.clone();
        channel.on_error(move |err| {
            let _ = tx.send(ChannelEvent::Closed {
                reason: format!("channel error: {}", err),
            });
        });

        debug!(channel_id = channel.id(), "Created confirm channel");
        Ok(BrokerSession {
            channel: Arc::new(LapinChannel {
                connection,
                channel,
                events: events_tx,
            }),
            events: events_rx,
        })
    }

    async fn verify_exchange(
        &self,
        uri: &str,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<bool> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;
        let verdict = match connection.create_channel().await {
            Ok(channel) => match channel
                .exchange_declare(
                    exchange,
                    exchange_kind(algorithm),
                    exchange_declare_options(options),
                    FieldTable::default(),
                )
                .await
            {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!(exchange, error = %e, "Exchange has wrong config");
                    Ok(false)
                }
            },
            Err(e) => Err(RabbitMQError::ChannelError(e.to_string())),
        };
        if let Err(e) = connection.close(200, "exchange check done").await {
            trace!(error = %e, "Side connection already closed");
        }
        verdict
    }
}

/// One lapin connection and its confirm channel.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(&self, queue: &str, options: &QueueOptions) -> Result<DeclaredQueue> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(options),
            )
            .await?;
        Ok(DeclaredQueue {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(algorithm),
                exchange_declare_options(options),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str, sink: DeliverySink) -> Result<()> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if sink.send(raw_delivery(delivery, &tag)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(consumer_tag = %tag, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
            trace!(consumer_tag = %tag, "Consumer stream ended");
        });
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
        wait_for_confirm: bool,
    ) -> Result<()> {
        let confirm: PublisherConfirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    ..BasicPublishOptions::default()
                },
                body,
                basic_properties(properties),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if wait_for_confirm {
            let confirmation = confirm.await?;
            return settle_confirmation(confirmation, &self.events);
        }

        // Returned messages only surface through the confirmation.
        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(confirmation) => {
                    if let Err(e) = settle_confirmation(confirmation, &events) {
                        warn!(error = %e, "Exchange publish was not confirmed");
                    }
                }
                Err(e) => trace!(error = %e, "Confirmation lost"),
            }
        });
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.channel.close(200, "Closing channel").await {
            trace!(error = %e, "Channel close failed");
        }
        self.connection.close(200, "Closing connection").await?;
        Ok(())
    }
}
