//! In-process broker.
//!
//! Implements the transport traits with the subset of broker behaviour the
//! substrate depends on: exchanges (direct, fanout, topic, headers), queues
//! with auto-delete and exclusive ownership, per-message expiration,
//! dead-letter routing, `mandatory` returns, publisher confirms and the
//! channel-closing 406 on inequivalent exchange redeclaration. Test hooks can
//! drop every connection or refuse the next connects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::transport::{
    AmqpChannel, AmqpConnector, BrokerSession, ChannelEvent, DeclaredQueue, DeliverySink,
    ExchangeAlgorithm, ExchangeOptions, PublishProperties, QueueOptions, RawDelivery,
    ReturnedMessage,
};

const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: PublishProperties,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct MemExchange {
    algorithm: ExchangeAlgorithm,
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

struct MemConsumer {
    tag: String,
    connection: u64,
    sink: DeliverySink,
}

struct MemQueue {
    options: QueueOptions,
    owner: u64,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemConsumer>,
    cursor: usize,
    had_consumer: bool,
}

struct MemConnection {
    events: mpsc::UnboundedSender<ChannelEvent>,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

/// Expiry timer to arm once the state lock is released.
struct Expiry {
    queue: String,
    message: u64,
    after: Duration,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, MemExchange>,
    queues: HashMap<String, MemQueue>,
    connections: HashMap<u64, MemConnection>,
    next_id: u64,
    refuse_connects: u32,
    connects: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, connection: u64) -> Result<()> {
        if self.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel is closed".to_string()))
        }
    }

    /// Routes a message and returns whether at least one queue took it.
    fn route(&mut self, message: StoredMessage, timers: &mut Vec<Expiry>) -> bool {
        let targets: Vec<String> = if message.exchange.is_empty() {
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            match self.exchanges.get(&message.exchange) {
                Some(exchange) => {
                    let mut targets: Vec<String> = exchange
                        .bindings
                        .iter()
                        .filter(|b| binding_matches(exchange.algorithm, &b.routing_key, &message.routing_key))
                        .map(|b| b.queue.clone())
                        .collect();
                    targets.dedup();
                    targets
                }
                None => Vec::new(),
            }
        };

        let routed = !targets.is_empty();
        for queue in targets {
            let copy = StoredMessage {
                id: self.next_id(),
                ..message.clone()
            };
            self.enqueue(&queue, copy, timers);
        }
        routed
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage, timers: &mut Vec<Expiry>) {
        if !self.queues.contains_key(queue_name) {
            return;
        }
        if let Some(message) = self.try_deliver(queue_name, message) {
            let expiration = message.properties.expiration_ms;
            let id = message.id;
            if let Some(queue) = self.queues.get_mut(queue_name) {
                queue.messages.push_back(message);
            }
            if let Some(ttl) = expiration {
                timers.push(Expiry {
                    queue: queue_name.to_string(),
                    message: id,
                    after: Duration::from_millis(ttl),
                });
            }
        }
    }

    /// Hands the message to the next live consumer, or gives it back.
    fn try_deliver(&mut self, queue_name: &str, message: StoredMessage) -> Option<StoredMessage> {
        let delivery_tag = self.next_id();
        let queue = self.queues.get_mut(queue_name)?;
        while !queue.consumers.is_empty() {
            let index = queue.cursor % queue.consumers.len();
            let consumer = &queue.consumers[index];
            let delivery = RawDelivery {
                delivery_tag,
                consumer_tag: consumer.tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                correlation_id: message.properties.correlation_id.clone(),
                reply_to: message.properties.reply_to.clone(),
                priority: Some(message.properties.priority),
            };
            if consumer.sink.send(delivery).is_ok() {
                queue.cursor = index + 1;
                let connection = consumer.connection;
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.unacked
                        .insert(delivery_tag, (queue_name.to_string(), message));
                }
                return None;
            }
            queue.consumers.remove(index);
        }
        Some(message)
    }

    fn drain(&mut self, queue_name: &str) {
        loop {
            let next = match self.queues.get_mut(queue_name) {
                Some(queue) if !queue.consumers.is_empty() => queue.messages.pop_front(),
                _ => None,
            };
            let Some(message) = next else { break };
            if let Some(message) = self.try_deliver(queue_name, message) {
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                }
                break;
            }
        }
    }

    fn dead_letter(&mut self, queue_name: &str, message: StoredMessage, timers: &mut Vec<Expiry>) {
        let Some(queue) = self.queues.get(queue_name) else { return };
        let Some(dlx) = queue.options.dead_letter_exchange.clone() else {
            trace!(queue = queue_name, "Dropping message, no dead letter exchange");
            return;
        };
        let routing_key = queue
            .options
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());
        let properties = PublishProperties {
            expiration_ms: None,
            mandatory: false,
            ..message.properties
        };
        let dead = StoredMessage {
            id: message.id,
            exchange: dlx,
            routing_key,
            body: message.body,
            properties,
        };
        self.route(dead, timers);
    }

    fn delete_queue(&mut self, queue_name: &str) {
        self.queues.remove(queue_name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue_name);
        }
    }

    fn auto_delete_if_idle(&mut self, queue_name: &str) {
        let remove = match self.queues.get(queue_name) {
            Some(queue) => queue.options.auto_delete && queue.had_consumer && queue.consumers.is_empty(),
            None => false,
        };
        if remove {
            debug!(queue = queue_name, "Auto-deleting queue");
            self.delete_queue(queue_name);
        }
    }

    fn close_connection(&mut self, connection: u64) -> Option<MemConnection> {
        let conn = self.connections.remove(&connection)?;
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.consumers.retain(|c| c.connection != connection);
            }
        }
        for (queue, message) in conn.unacked.values().cloned() {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(message);
            }
        }
        for name in &names {
            let exclusive = matches!(self.queues.get(name), Some(q) if q.options.exclusive && q.owner == connection);
            if exclusive {
                self.delete_queue(name);
            } else {
                self.auto_delete_if_idle(name);
            }
        }
        for name in &names {
            self.drain(name);
        }
        Some(conn)
    }
}

fn binding_matches(algorithm: ExchangeAlgorithm, binding_key: &str, routing_key: &str) -> bool {
    match algorithm {
        ExchangeAlgorithm::Fanout | ExchangeAlgorithm::Headers => true,
        ExchangeAlgorithm::Direct => binding_key == routing_key,
        ExchangeAlgorithm::Topic => topic_matches(binding_key, routing_key),
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &words)
}

/// A broker living inside the current process. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, timers: Vec<Expiry>) {
        for timer in timers {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timer.after).await;
                broker.expire(&timer.queue, timer.message);
            });
        }
    }

    fn expire(&self, queue_name: &str, message_id: u64) {
        let mut timers = Vec::new();
        {
            let mut state = self.lock();
            let expired = state.queues.get_mut(queue_name).and_then(|queue| {
                let position = queue.messages.iter().position(|m| m.id == message_id)?;
                queue.messages.remove(position)
            });
            if let Some(message) = expired {
                trace!(queue = queue_name, "Message expired");
                state.dead_letter(queue_name, message, &mut timers);
            }
        }
        self.arm(timers);
    }

    fn close_with_reason(&self, connection: u64, reason: &str) {
        let closed = self.lock().close_connection(connection);
        if let Some(conn) = closed {
            let _ = conn.events.send(ChannelEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Simulates a broker restart: every open connection is closed.
    pub fn drop_connections(&self) {
        let ids: Vec<u64> = self.lock().connections.keys().copied().collect();
        for id in ids {
            self.close_with_reason(id, "CONNECTION_FORCED - broker forced connection closure");
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn binding_count(&self, exchange: &str) -> usize {
        self.lock().exchanges.get(exchange).map_or(0, |e| e.bindings.len())
    }

    /// Declares a queue outside of any client session.
    pub fn declare_queue(&self, queue: &str, options: QueueOptions) {
        self.lock().queues.entry(queue.to_string()).or_insert_with(|| MemQueue {
            options,
            owner: 0,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        });
    }

    /// Publishes as a foreign producer would; returns whether it was routed.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: &[u8], properties: PublishProperties) -> bool {
        let mut timers = Vec::new();
        let routed = {
            let mut state = self.lock();
            let id = state.next_id();
            state.route(
                StoredMessage {
                    id,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties,
                },
                &mut timers,
            )
        };
        self.arm(timers);
        routed
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    async fn connect(&self, uri: &str, _prefetch: u16) -> Result<BrokerSession> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(RabbitMQError::ConnectionError(format!(
                    "Failed to connect: connection refused by {}",
                    uri
                )));
            }
            state.connects += 1;
            let id = state.next_id();
            state.connections.insert(
                id,
                MemConnection {
                    events: events_tx,
                    unacked: HashMap::new(),
                },
            );
            id
        };
        debug!(connection = id, "Memory broker accepted connection");
        Ok(BrokerSession {
            channel: Arc::new(MemoryChannel {
                broker: self.clone(),
                connection: id,
            }),
            events: events_rx,
        })
    }

    async fn verify_exchange(
        &self,
        _uri: &str,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state.exchanges.get(exchange) {
            Some(existing) => Ok(existing.algorithm == algorithm && existing.options.durable == options.durable),
            None => {
                state.exchanges.insert(
                    exchange.to_string(),
                    MemExchange {
                        algorithm,
                        options: options.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(true)
            }
        }
    }
}

/// Channel handle for one in-process connection.
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn queue_declare(&self, queue: &str, options: &QueueOptions) -> Result<DeclaredQueue> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };
        let connection = self.connection;
        let entry = state.queues.entry(name.clone()).or_insert_with(|| MemQueue {
            options: options.clone(),
            owner: connection,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        });
        Ok(DeclaredQueue {
            name,
            message_count: entry.messages.len() as u32,
            consumer_count: entry.consumers.len() as u32,
        })
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        algorithm: ExchangeAlgorithm,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let mismatch = {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            match state.exchanges.get(exchange) {
                Some(existing) => existing.algorithm != algorithm || existing.options.durable != options.durable,
                None => {
                    state.exchanges.insert(
                        exchange.to_string(),
                        MemExchange {
                            algorithm,
                            options: options.clone(),
                            bindings: Vec::new(),
                        },
                    );
                    false
                }
            }
        };
        if mismatch {
            let reason = format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                exchange
            );
            self.broker.close_with_reason(self.connection, &reason);
            return Err(RabbitMQError::ChannelError(reason));
        }
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        if !state.queues.contains_key(queue) {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            return Err(RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange)));
        };
        let exists = target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        if let Some(target) = state.exchanges.get_mut(exchange) {
            target
                .bindings
                .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str, sink: DeliverySink) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue)));
        };
        target.consumers.push(MemConsumer {
            tag: consumer_tag.to_string(),
            connection: self.connection,
            sink,
        });
        target.had_consumer = true;
        state.drain(queue);
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        let owning: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owning {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.consumers.retain(|c| c.tag != consumer_tag);
            }
            state.auto_delete_if_idle(&name);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
        _wait_for_confirm: bool,
    ) -> Result<()> {
        let mut timers = Vec::new();
        let outcome = {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                Err(format!("NOT_FOUND - no exchange '{}'", exchange))
            } else {
                let id = state.next_id();
                let routed = state.route(
                    StoredMessage {
                        id,
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                        properties: properties.clone(),
                    },
                    &mut timers,
                );
                if !routed && properties.mandatory {
                    if let Some(conn) = state.connections.get(&self.connection) {
                        let _ = conn.events.send(ChannelEvent::Returned(ReturnedMessage {
                            exchange: exchange.to_string(),
                            routing_key: routing_key.to_string(),
                            reply_code: NO_ROUTE,
                            reply_text: "NO_ROUTE".to_string(),
                            body: body.to_vec(),
                            correlation_id: properties.correlation_id.clone(),
                            reply_to: properties.reply_to.clone(),
                        }));
                    }
                }
                Ok(())
            }
        };
        self.broker.arm(timers);
        if let Err(reason) = outcome {
            self.broker.close_with_reason(self.connection, &reason);
            return Err(RabbitMQError::ChannelError(reason));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        if let Some(conn) = state.connections.get_mut(&self.connection) {
            conn.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut timers = Vec::new();
        {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            let entry = state
                .connections
                .get_mut(&self.connection)
                .and_then(|conn| conn.unacked.remove(&delivery_tag));
            if let Some((queue, message)) = entry {
                if requeue {
                    state.enqueue(&queue, message, &mut timers);
                } else {
                    state.dead_letter(&queue, message, &mut timers);
                }
            }
        }
        self.broker.arm(timers);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_connection(self.connection);
        Ok(())
    }
}
