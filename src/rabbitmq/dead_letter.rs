use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::client::BrokerClient;
use super::consumer::{Acker, QueueMessage};
use super::publisher::Outbound;
use super::transport::ReturnedMessage;
use crate::message::timeout_body;

pub const BAD_QUEUE_CAPACITY: usize = 100;

/// Routing keys that recently came back unroutable.
///
/// Bounded with FIFO eviction. Advisory only.
pub struct BadQueueSet {
    keys: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for BadQueueSet {
    fn default() -> Self {
        Self::with_capacity(BAD_QUEUE_CAPACITY)
    }
}

impl BadQueueSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, key: &str) {
        if key.is_empty() || self.capacity == 0 {
            return;
        }
        let mut keys = self.lock();
        if keys.iter().any(|k| k == key) {
            return;
        }
        while keys.len() >= self.capacity {
            keys.pop_front();
        }
        keys.push_back(key.to_string());
    }

    pub fn remove(&self, key: &str) {
        self.lock().retain(|k| k != key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().iter().any(|k| k == key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}

impl BrokerClient {
    /// Consumer of the dead-letter exchange. Only the instance owning the
    /// `reply_to` queue answers; everybody else just logs.
    pub(crate) async fn on_dead_letter(&self, message: QueueMessage, acker: Acker) {
        if let Err(e) = acker.ack(true).await {
            warn!(error = %e, "Failed to ack dead letter");
        }
        let options = &message.options;
        let Some(reply_to) = options.reply_to.as_deref() else {
            debug!(routing_key = %options.routing_key, "Dead letter without reply_to, dropping");
            return;
        };

        if self.is_my_queue(reply_to) {
            warn!(
                correlation_id = ?options.correlation_id,
                reply_to,
                routing_key = %options.routing_key,
                "Message expired, sending timeout"
            );
            self.send_timeout(reply_to, options.correlation_id.clone(), &message.body)
                .await;
        } else {
            debug!(
                correlation_id = ?options.correlation_id,
                reply_to,
                "Dead letter belongs to another instance"
            );
        }
    }

    /// A `mandatory` publish found no queue. The caller, if any, gets a
    /// timeout right away.
    pub(crate) async fn on_returned_message(&self, returned: ReturnedMessage) {
        self.inner.bad_queues.record(&returned.routing_key);
        let reply_to = returned.reply_to.filter(|r| !r.is_empty());
        let Some(reply_to) = reply_to else {
            debug!(
                exchange = %returned.exchange,
                routing_key = %returned.routing_key,
                reply_code = returned.reply_code,
                "Message returned as unroutable"
            );
            return;
        };
        warn!(
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            correlation_id = ?returned.correlation_id,
            reply_to = %reply_to,
            "Message returned as unroutable, sending timeout"
        );
        let body = String::from_utf8_lossy(&returned.body);
        self.send_timeout(&reply_to, returned.correlation_id, &body).await;
    }

    async fn send_timeout(&self, reply_to: &str, correlation_id: Option<String>, body: &str) {
        let expiration = self.inner.config.timeout_reply_expiration_ms as i64;
        let mut outbound = Outbound::to_queue(reply_to, timeout_body(body)).with_expiration(expiration);
        if let Some(correlation_id) = correlation_id {
            outbound = outbound.with_correlation_id(correlation_id);
        }
        if let Err(e) = self.send(outbound).await {
            warn!(reply_to, error = %e, "Failed to send timeout reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_keys() {
        let set = BadQueueSet::default();
        for i in 0..150 {
            set.record(&format!("queue-{}", i));
            assert!(set.len() <= BAD_QUEUE_CAPACITY);
        }
        assert_eq!(set.len(), BAD_QUEUE_CAPACITY);
        assert!(!set.contains("queue-49"));
        for i in 50..150 {
            assert!(set.contains(&format!("queue-{}", i)));
        }
        assert_eq!(set.snapshot().first().map(String::as_str), Some("queue-50"));
    }

    #[test]
    fn duplicates_and_removals() {
        let set = BadQueueSet::with_capacity(2);
        set.record("a");
        set.record("a");
        assert_eq!(set.len(), 1);
        set.record("b");
        set.record("c");
        assert_eq!(set.snapshot(), vec!["b".to_string(), "c".to_string()]);
        set.remove("b");
        assert!(!set.contains("b"));
        set.record("");
        assert_eq!(set.len(), 1);
    }
}
