use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::errors::{RabbitMQError, Result};
use super::transport::{
    AmqpChannel, DeclaredQueue, DeliverySink, ExchangeAlgorithm, ExchangeOptions,
    PublishProperties, QueueOptions,
};

struct ActiveChannel {
    generation: u64,
    channel: Arc<dyn AmqpChannel>,
}

/// Owns the one broker channel of a client.
///
/// Every operation holds the lock for its whole duration, so at most one
/// broker call is in flight on the channel at a time. Each installed channel
/// gets a new generation; acks carrying an older generation are dropped since
/// their delivery tags are meaningless on the new channel.
pub struct ChannelManager {
    channel: Mutex<Option<ActiveChannel>>,
    generation: AtomicU64,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Installs a fresh channel and returns its generation.
    pub async fn install(&self, channel: Arc<dyn AmqpChannel>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.channel.lock().await;
        *guard = Some(ActiveChannel {
            generation,
            channel,
        });
        debug!(generation, "Installed broker channel");
        generation
    }

    /// Removes the channel if it still belongs to `generation`.
    pub async fn clear(&self, generation: u64) -> bool {
        let mut guard = self.channel.lock().await;
        match &*guard {
            Some(active) if active.generation == generation => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    /// Removes whatever channel is installed.
    pub async fn take(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.channel.lock().await.take().map(|active| active.channel)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn is_active(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    pub async fn queue_declare(&self, queue: &str, options: &QueueOptions) -> Result<DeclaredQueue> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.queue_declare(queue, options).await
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.exchange_declare(exchange, algorithm, options).await
    }

    pub async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.queue_bind(queue, exchange, routing_key).await
    }

    pub async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.queue_unbind(queue, exchange, routing_key).await
    }

    /// Starts a consumer and reports the generation it is bound to.
    pub async fn basic_consume(&self, queue: &str, consumer_tag: &str, sink: DeliverySink) -> Result<u64> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.basic_consume(queue, consumer_tag, sink).await?;
        Ok(active.generation)
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active.channel.basic_cancel(consumer_tag).await
    }

    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
        wait_for_confirm: bool,
    ) -> Result<()> {
        let guard = self.channel.lock().await;
        let active = require(&guard)?;
        active
            .channel
            .basic_publish(exchange, routing_key, body, properties, wait_for_confirm)
            .await
    }

    pub async fn basic_ack(&self, generation: u64, delivery_tag: u64) -> Result<()> {
        let guard = self.channel.lock().await;
        match &*guard {
            Some(active) if active.generation == generation => active.channel.basic_ack(delivery_tag).await,
            _ => {
                trace!(generation, delivery_tag, "Skipping ack for a stale channel");
                Ok(())
            }
        }
    }

    pub async fn basic_nack(&self, generation: u64, delivery_tag: u64, requeue: bool) -> Result<()> {
        let guard = self.channel.lock().await;
        match &*guard {
            Some(active) if active.generation == generation => {
                active.channel.basic_nack(delivery_tag, requeue).await
            }
            _ => {
                trace!(generation, delivery_tag, "Skipping nack for a stale channel");
                Ok(())
            }
        }
    }
}

fn require(active: &Option<ActiveChannel>) -> Result<&ActiveChannel> {
    active
        .as_ref()
        .ok_or_else(|| RabbitMQError::NotConnected("no open channel".to_string()))
}
