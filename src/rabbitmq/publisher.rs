use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use super::client::BrokerClient;
use super::control_plane::OF_EXCHANGE;
use super::errors::{RabbitMQError, Result, MAX_MESSAGE_SIZE};
use super::transport::PublishProperties;
use crate::message::Payload;

const RETRY_PAUSE: Duration = Duration::from_millis(100);
const MAX_PUBLISH_ATTEMPTS: u32 = 10;

/// One outgoing message.
///
/// An empty `exchange` publishes straight to `queue` and waits for the
/// broker's confirm; otherwise the message goes to `exchange` with
/// `routing_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub exchange: String,
    pub queue: String,
    pub payload: Payload,
    /// Below 1 means the configured default.
    pub expiration_ms: i64,
    pub correlation_id: Option<String>,
    pub routing_key: String,
    pub priority: u8,
}

impl Outbound {
    pub fn to_queue(queue: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            exchange: String::new(),
            queue: queue.into(),
            payload: payload.into(),
            expiration_ms: 0,
            correlation_id: None,
            routing_key: String::new(),
            priority: 1,
        }
    }

    pub fn to_exchange(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Self::to_queue("", payload)
        }
    }

    pub fn with_expiration(mut self, expiration_ms: i64) -> Self {
        self.expiration_ms = expiration_ms;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    fn target(&self) -> &str {
        if self.exchange.is_empty() {
            &self.queue
        } else {
            &self.exchange
        }
    }
}

/// Per-queue count of direct-to-queue publishes.
#[derive(Default)]
pub(crate) struct OutboundCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl OutboundCounters {
    pub(crate) fn increment(&self, queue: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(queue.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn get(&self, queue: &str) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.get(queue).copied().unwrap_or(0)
    }
}

pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Serializes the payload and enforces the size cap.
pub(crate) fn encode(payload: &Payload) -> Result<Vec<u8>> {
    let body = payload.to_bytes()?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(RabbitMQError::PayloadTooLarge {
            size: body.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(body)
}

impl BrokerClient {
    /// Fire-and-forget publish.
    ///
    /// Oversized payloads fail before anything else happens. While
    /// disconnected the call waits for the connection to come back.
    pub async fn send(&self, outbound: Outbound) -> Result<()> {
        if outbound.exchange == OF_EXCHANGE && !self.inner.config.enable_control_broadcast {
            trace!("Control broadcast disabled, dropping message");
            return Ok(());
        }
        let body = encode(&outbound.payload)?;
        let correlation_id = outbound
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        self.publish_with_retry(&outbound, &body, &correlation_id, false).await
    }

    pub(crate) async fn publish_with_retry(
        &self,
        outbound: &Outbound,
        body: &[u8],
        correlation_id: &str,
        with_reply: bool,
    ) -> Result<()> {
        let expiration = if outbound.expiration_ms < 1 {
            self.inner.config.default_expiration_ms
        } else {
            outbound.expiration_ms as u64
        };

        let mut attempts = 0;
        loop {
            self.wait_for_connected().await?;

            // The reply queue is renamed on every reconnect.
            let reply_to = if with_reply {
                match self.reply_queue_name() {
                    Some(name) => Some(name),
                    None => {
                        attempts += 1;
                        if attempts >= MAX_PUBLISH_ATTEMPTS {
                            return Err(RabbitMQError::NotConnected("no reply queue".to_string()));
                        }
                        debug!(correlation_id, attempt = attempts, "Reply queue not ready, waiting");
                        tokio::time::sleep(RETRY_PAUSE).await;
                        continue;
                    }
                }
            } else {
                None
            };

            let properties = PublishProperties {
                correlation_id: Some(correlation_id.to_string()),
                reply_to,
                expiration_ms: Some(expiration),
                priority: outbound.priority,
                mandatory: true,
            };
            trace!(
                target_name = outbound.target(),
                correlation_id,
                expiration_ms = expiration,
                "Publishing message"
            );

            let channels = &self.inner.channels;
            let result = if outbound.exchange.is_empty() {
                channels
                    .basic_publish("", &outbound.queue, body, &properties, true)
                    .await
                    .map(|()| self.inner.counters.increment(&outbound.queue))
            } else {
                channels
                    .basic_publish(&outbound.exchange, &outbound.routing_key, body, &properties, false)
                    .await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempts + 1 < MAX_PUBLISH_ATTEMPTS => {
                    attempts += 1;
                    debug!(
                        target_name = outbound.target(),
                        correlation_id,
                        attempt = attempts,
                        error = %e,
                        "Publish failed, waiting for connection"
                    );
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
