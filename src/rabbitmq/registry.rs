use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::client::BrokerClient;
use super::consumer::{spawn_consumer, SharedHandler};
use super::errors::{RabbitMQError, Result};
use super::transport::{ExchangeAlgorithm, ExchangeOptions, QueueOptions};

/// A consumer this client started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRegistration {
    /// Name the caller asked for; empty for anonymous queues.
    pub queue: String,
    /// Name the broker actually declared.
    pub queue_name: String,
    pub options: QueueOptions,
    pub consumer_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRegistration {
    pub exchange: String,
    pub algorithm: ExchangeAlgorithm,
    pub routing_key: String,
    pub options: ExchangeOptions,
    pub queue: Option<QueueRegistration>,
}

#[derive(Default)]
struct Registrations {
    queues: Vec<QueueRegistration>,
    exchanges: Vec<ExchangeRegistration>,
}

/// Source of truth for "is this queue or consumer mine".
#[derive(Default)]
pub(crate) struct QueueRegistry {
    inner: RwLock<Registrations>,
}

impl QueueRegistry {
    fn read(&self) -> RwLockReadGuard<'_, Registrations> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registrations> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert_queue(&self, registration: QueueRegistration) {
        self.write().queues.push(registration);
    }

    pub(crate) fn remove_queue(&self, consumer_tag: &str) -> Option<QueueRegistration> {
        let mut guard = self.write();
        let index = guard.queues.iter().position(|q| q.consumer_tag == consumer_tag)?;
        Some(guard.queues.remove(index))
    }

    pub(crate) fn insert_exchange(&self, registration: ExchangeRegistration) {
        self.write().exchanges.push(registration);
    }

    /// Detaches every exchange registration bound to `queue_name`.
    pub(crate) fn take_exchanges_bound_to(&self, queue_name: &str) -> Vec<ExchangeRegistration> {
        let mut guard = self.write();
        let (bound, rest): (Vec<_>, Vec<_>) = guard
            .exchanges
            .drain(..)
            .partition(|e| matches!(&e.queue, Some(q) if q.queue_name == queue_name));
        guard.exchanges = rest;
        bound
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.write();
        guard.queues.clear();
        guard.exchanges.clear();
    }

    pub(crate) fn contains_queue(&self, name: &str) -> bool {
        self.read()
            .queues
            .iter()
            .any(|q| q.queue_name == name || (!q.queue.is_empty() && q.queue == name))
    }

    pub(crate) fn contains_consumer_tag(&self, consumer_tag: &str) -> bool {
        self.read().queues.iter().any(|q| q.consumer_tag == consumer_tag)
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.read().queues.len()
    }

    pub(crate) fn exchanges(&self) -> Vec<ExchangeRegistration> {
        self.read().exchanges.clone()
    }
}

impl BrokerClient {
    /// Declares `queue` and starts a manual-ack consumer on it.
    ///
    /// An empty name, or one starting with `amq.`, asks the broker for an
    /// anonymous queue, which is always auto-delete. `None` options mean
    /// [`BrokerClient::default_queue_options`].
    pub async fn add_queue_consumer(
        &self,
        queue: &str,
        options: Option<QueueOptions>,
        handler: SharedHandler,
    ) -> Result<QueueRegistration> {
        let options = options.unwrap_or_else(|| self.default_queue_options());
        let registration = self.declare_and_consume(queue, options, handler).await?;
        self.inner.registry.insert_queue(registration.clone());
        Ok(registration)
    }

    pub(crate) async fn declare_and_consume(
        &self,
        queue: &str,
        mut options: QueueOptions,
        handler: SharedHandler,
    ) -> Result<QueueRegistration> {
        let requested = if queue.starts_with("amq.") { "" } else { queue };
        if requested.is_empty() {
            options.auto_delete = true;
        }

        let channels = &self.inner.channels;
        let declared = channels.queue_declare(requested, &options).await?;
        self.inner.bad_queues.remove(&declared.name);

        let consumer_tag = format!("ctag-{}", Uuid::new_v4().simple());
        let (sink, deliveries) = mpsc::unbounded_channel();
        let generation = channels.basic_consume(&declared.name, &consumer_tag, sink).await?;
        spawn_consumer(channels.clone(), generation, deliveries, handler);

        debug!(
            queue = %declared.name,
            consumer_tag = %consumer_tag,
            messages = declared.message_count,
            "Consuming queue"
        );
        Ok(QueueRegistration {
            queue: requested.to_string(),
            queue_name: declared.name,
            options,
            consumer_tag,
        })
    }

    /// Cancels the consumer and unbinds any exchange bound to its queue.
    ///
    /// Removing a registration that is already gone does nothing.
    pub async fn remove_queue_consumer(&self, registration: &QueueRegistration) -> Result<()> {
        let Some(removed) = self.inner.registry.remove_queue(&registration.consumer_tag) else {
            trace!(consumer_tag = %registration.consumer_tag, "Consumer already removed");
            return Ok(());
        };

        let channels = &self.inner.channels;
        for exchange in self.inner.registry.take_exchanges_bound_to(&removed.queue_name) {
            if let Err(e) = channels
                .queue_unbind(&removed.queue_name, &exchange.exchange, &exchange.routing_key)
                .await
            {
                warn!(
                    exchange = %exchange.exchange,
                    queue = %removed.queue_name,
                    error = %e,
                    "Failed to unbind queue"
                );
            }
        }

        match channels.basic_cancel(&removed.consumer_tag).await {
            Ok(()) => {
                debug!(queue = %removed.queue_name, consumer_tag = %removed.consumer_tag, "Cancelled consumer");
                Ok(())
            }
            // The consumer died with the channel.
            Err(e) if e.is_transient() => {
                debug!(consumer_tag = %removed.consumer_tag, error = %e, "Consumer gone with its channel");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Declares an exchange and, with `bind_queue`, an anonymous queue bound
    /// to it that feeds `handler`.
    ///
    /// The exchange is never auto-delete. Nothing is recorded unless every
    /// step succeeded.
    pub async fn add_exchange_consumer(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        routing_key: &str,
        options: Option<ExchangeOptions>,
        bind_queue: bool,
        handler: SharedHandler,
    ) -> Result<ExchangeRegistration> {
        if exchange.is_empty() {
            return Err(RabbitMQError::InvalidArgument(
                "exchange name cannot be empty".to_string(),
            ));
        }
        let mut options = options.unwrap_or_default();
        options.auto_delete = false;

        self.pre_assert_exchange(exchange, algorithm, &options).await?;
        let channels = &self.inner.channels;
        channels.exchange_declare(exchange, algorithm, &options).await?;

        let queue = if bind_queue {
            let queue_options = if exchange == self.inner.config.dead_letter_exchange {
                QueueOptions {
                    durable: true,
                    ..QueueOptions::default()
                }
            } else {
                self.default_queue_options()
            };
            let registration = self.add_queue_consumer("", Some(queue_options), handler).await?;
            if let Err(e) = channels
                .queue_bind(&registration.queue_name, exchange, routing_key)
                .await
            {
                warn!(exchange, queue = %registration.queue_name, error = %e, "Failed to bind queue");
                if let Err(cleanup) = self.remove_queue_consumer(&registration).await {
                    debug!(error = %cleanup, "Failed to remove consumer after bind failure");
                }
                return Err(e);
            }
            if !routing_key.is_empty() {
                self.inner.bad_queues.remove(routing_key);
            }
            Some(registration)
        } else {
            None
        };

        let registration = ExchangeRegistration {
            exchange: exchange.to_string(),
            algorithm,
            routing_key: routing_key.to_string(),
            options,
            queue,
        };
        debug!(exchange, algorithm = algorithm.as_str(), routing_key, "Exchange consumer ready");
        self.inner.registry.insert_exchange(registration.clone());
        Ok(registration)
    }

    /// Checks `exchange` on a side connection so an incompatible declaration
    /// never reaches the shared channel.
    pub async fn pre_assert_exchange(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<()> {
        if !self.inner.config.verify_exchanges {
            return Ok(());
        }
        let compatible = self
            .inner
            .connector
            .verify_exchange(&self.inner.config.url, exchange, algorithm, options)
            .await?;
        if compatible {
            Ok(())
        } else {
            warn!(exchange, algorithm = algorithm.as_str(), "Exchange exists with a different configuration");
            Err(RabbitMQError::ExchangeMismatch(exchange.to_string()))
        }
    }

    /// True for the reply queue and for any queue registered here, by
    /// requested or broker-assigned name.
    pub fn is_my_queue(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if self.reply_queue_name().as_deref() == Some(name) {
            return true;
        }
        self.inner.registry.contains_queue(name)
    }

    pub fn is_my_consumer_tag(&self, consumer_tag: &str) -> bool {
        let reply = self.inner.reply_queue.read().unwrap_or_else(|p| p.into_inner());
        if matches!(&*reply, Some(r) if r.consumer_tag == consumer_tag) {
            return true;
        }
        drop(reply);
        self.inner.registry.contains_consumer_tag(consumer_tag)
    }

    pub fn queue_registration_count(&self) -> usize {
        self.inner.registry.queue_count()
    }

    pub fn exchange_registrations(&self) -> Vec<ExchangeRegistration> {
        self.inner.registry.exchanges()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(queue: &str, name: &str, tag: &str) -> QueueRegistration {
        QueueRegistration {
            queue: queue.to_string(),
            queue_name: name.to_string(),
            options: QueueOptions::default(),
            consumer_tag: tag.to_string(),
        }
    }

    #[test]
    fn lookups_match_requested_and_assigned_names() {
        let registry = QueueRegistry::default();
        registry.insert_queue(registration("", "amq.gen-1", "ctag-1"));
        registry.insert_queue(registration("work", "work", "ctag-2"));
        assert!(registry.contains_queue("amq.gen-1"));
        assert!(registry.contains_queue("work"));
        assert!(!registry.contains_queue(""));
        assert!(registry.contains_consumer_tag("ctag-2"));
        assert!(registry.remove_queue("ctag-2").is_some());
        assert!(registry.remove_queue("ctag-2").is_none());
        assert!(!registry.contains_queue("work"));
    }

    #[test]
    fn bound_exchanges_are_detached_with_their_queue() {
        let registry = QueueRegistry::default();
        let queue = registration("", "amq.gen-1", "ctag-1");
        registry.insert_exchange(ExchangeRegistration {
            exchange: "events".into(),
            algorithm: ExchangeAlgorithm::Fanout,
            routing_key: String::new(),
            options: ExchangeOptions::default(),
            queue: Some(queue),
        });
        registry.insert_exchange(ExchangeRegistration {
            exchange: "other".into(),
            algorithm: ExchangeAlgorithm::Topic,
            routing_key: "a.*".into(),
            options: ExchangeOptions::default(),
            queue: None,
        });
        let bound = registry.take_exchanges_bound_to("amq.gen-1");
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].exchange, "events");
        assert_eq!(registry.exchanges().len(), 1);
    }
}
