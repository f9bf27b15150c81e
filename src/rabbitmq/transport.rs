//! Broker transport seam.
//!
//! Everything above this module talks to the broker through [`AmqpConnector`]
//! and [`AmqpChannel`]. `amqp_client` implements them on top of lapin and
//! `memory` implements them in-process.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::Result;

/// Routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeAlgorithm {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeAlgorithm::Direct => "direct",
            ExchangeAlgorithm::Fanout => "fanout",
            ExchangeAlgorithm::Topic => "topic",
            ExchangeAlgorithm::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Sets `x-dead-letter-exchange`.
    pub dead_letter_exchange: Option<String>,
    /// Sets `x-dead-letter-routing-key`.
    pub dead_letter_routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Envelope fields carried as broker message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration_ms: Option<u64>,
    pub priority: u8,
    pub mandatory: bool,
}

/// A message handed to a consumer, before any decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: Option<u8>,
}

/// A `mandatory` publish the broker could not route anywhere.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Asynchronous notifications raised by a session.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Returned(ReturnedMessage),
    Closed { reason: String },
}

pub type DeliverySink = mpsc::UnboundedSender<RawDelivery>;

/// A live connection with its single multiplexed channel.
pub struct BrokerSession {
    pub channel: Arc<dyn AmqpChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Opens a connection plus a confirm-mode channel with the given prefetch.
    async fn connect(&self, uri: &str, prefetch: u16) -> Result<BrokerSession>;

    /// Asserts an exchange on a short-lived side connection.
    ///
    /// Returns `Ok(false)` when the exchange exists with incompatible
    /// settings. The shared channel is never touched.
    async fn verify_exchange(
        &self,
        uri: &str,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<bool>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn queue_declare(&self, queue: &str, options: &QueueOptions) -> Result<DeclaredQueue>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Starts a manual-ack consumer; deliveries are pushed into `sink` until
    /// the consumer is cancelled or the channel dies.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str, sink: DeliverySink) -> Result<()>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publishes one message. With `wait_for_confirm` the call returns only
    /// after the broker confirmed it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
        wait_for_confirm: bool,
    ) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
