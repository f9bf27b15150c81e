use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::client::BrokerClient;
use super::consumer::{Acker, QueueMessage};
use super::errors::{RabbitMQError, Result};
use super::publisher::{encode, new_correlation_id, Outbound};
use crate::message::Reply;

type Completion = oneshot::Sender<String>;

/// Outstanding RPC calls keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, Completion>>,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Completion>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<String>> {
        let mut calls = self.lock();
        if calls.contains_key(correlation_id) {
            return Err(RabbitMQError::DuplicateCorrelationId(correlation_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        calls.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Completes the call; false when nothing was waiting on this id.
    pub(crate) fn resolve(&self, correlation_id: &str, body: String) -> bool {
        let Some(completion) = self.lock().remove(correlation_id) else {
            return false;
        };
        if completion.send(body).is_err() {
            trace!(correlation_id, "Caller stopped waiting for its reply");
        }
        true
    }

    pub(crate) fn forget(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Completion of one `send_with_reply` call.
///
/// Resolves with the reply body, which is a timeout marker when the request
/// expired or could not be routed.
#[derive(Debug)]
pub struct ReplyHandle {
    correlation_id: String,
    receiver: oneshot::Receiver<String>,
}

impl ReplyHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for ReplyHandle {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map(Reply::new).map_err(|_| RabbitMQError::ResponseChannelClosed))
    }
}

impl BrokerClient {
    /// Publishes a request with `reply_to` set to this client's reply queue
    /// and returns the handle that resolves on the reply.
    ///
    /// There is no call-side timeout; the message expiration bounds the
    /// wait through the dead-letter path.
    pub async fn send_with_reply(&self, outbound: Outbound) -> Result<ReplyHandle> {
        let body = encode(&outbound.payload)?;
        let correlation_id = outbound
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        let receiver = self.inner.pending.register(&correlation_id)?;

        if let Err(e) = self
            .publish_with_retry(&outbound, &body, &correlation_id, true)
            .await
        {
            self.inner.pending.forget(&correlation_id);
            return Err(e);
        }
        Ok(ReplyHandle {
            correlation_id,
            receiver,
        })
    }

    pub(crate) async fn on_reply(&self, message: QueueMessage, acker: Acker) {
        if let Err(e) = acker.ack(true).await {
            warn!(error = %e, "Failed to ack reply");
        }
        let Some(correlation_id) = message.options.correlation_id else {
            debug!("Dropping reply without correlation id");
            return;
        };
        if !self.inner.pending.resolve(&correlation_id, message.body) {
            debug!(correlation_id = %correlation_id, "No pending call for reply, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let pending = PendingCalls::default();
        let rx = pending.register("abc").unwrap();
        assert!(matches!(
            pending.register("abc"),
            Err(RabbitMQError::DuplicateCorrelationId(_))
        ));
        assert!(pending.resolve("abc", "timeout".into()));
        assert!(!pending.resolve("abc", "real reply".into()));
        assert_eq!(rx.await.unwrap(), "timeout");
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn dropped_completion_closes_the_handle() {
        let pending = PendingCalls::default();
        let receiver = pending.register("abc").unwrap();
        pending.forget("abc");
        let handle = ReplyHandle {
            correlation_id: "abc".into(),
            receiver,
        };
        assert!(matches!(handle.await, Err(RabbitMQError::ResponseChannelClosed)));
    }
}
