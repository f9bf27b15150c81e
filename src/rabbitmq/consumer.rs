use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::channel_manager::ChannelManager;
use super::client::{BrokerClient, Inner};
use super::errors::Result;
use super::transport::RawDelivery;

/// Envelope fields of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessageOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub consumer_tag: String,
    pub routing_key: String,
    pub exchange_name: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub options: QueueMessageOptions,
}

impl From<RawDelivery> for QueueMessage {
    fn from(delivery: RawDelivery) -> Self {
        QueueMessage {
            body: String::from_utf8_lossy(&delivery.body).into_owned(),
            options: QueueMessageOptions {
                correlation_id: delivery.correlation_id.filter(|id| !id.is_empty()),
                reply_to: delivery.reply_to.filter(|r| !r.is_empty()),
                consumer_tag: delivery.consumer_tag,
                routing_key: delivery.routing_key,
                exchange_name: delivery.exchange,
                priority: delivery.priority.unwrap_or(0),
            },
        }
    }
}

/// Settles one delivery.
///
/// Clones share the outcome: the first `ack` call decides, later calls do
/// nothing. A rejected delivery is never requeued.
#[derive(Clone)]
pub struct Acker {
    channels: Arc<ChannelManager>,
    generation: u64,
    delivery_tag: u64,
    settled: Arc<AtomicBool>,
}

impl Acker {
    fn new(channels: Arc<ChannelManager>, generation: u64, delivery_tag: u64) -> Self {
        Self {
            channels,
            generation,
            delivery_tag,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acks when `accept` is true, otherwise nacks without requeue.
    pub async fn ack(&self, accept: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            trace!(delivery_tag = self.delivery_tag, "Delivery already settled");
            return Ok(());
        }
        if accept {
            self.channels.basic_ack(self.generation, self.delivery_tag).await
        } else {
            self.channels
                .basic_nack(self.generation, self.delivery_tag, false)
                .await
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Runs once after the handler returned.
    async fn done(&self) {
        if self.is_settled() {
            return;
        }
        debug!(delivery_tag = self.delivery_tag, "Handler left delivery unsettled, rejecting");
        if let Err(e) = self.ack(false).await {
            warn!(delivery_tag = self.delivery_tag, error = %e, "Failed to reject delivery");
        }
    }
}

/// Callback for a queue consumer.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage, acker: Acker);
}

#[async_trait]
impl<F, Fut> QueueHandler for F
where
    F: Fn(QueueMessage, Acker) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: QueueMessage, acker: Acker) {
        (self)(message, acker).await
    }
}

pub type SharedHandler = Arc<dyn QueueHandler>;

/// Wraps a closure as a [`SharedHandler`].
pub fn handler<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(QueueMessage, Acker) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(f)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Feeds deliveries to `handler`, one task per delivery. A panicking handler
/// still gets its delivery settled.
pub(crate) fn spawn_consumer(
    channels: Arc<ChannelManager>,
    generation: u64,
    mut deliveries: mpsc::UnboundedReceiver<RawDelivery>,
    handler: SharedHandler,
) {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let acker = Acker::new(channels.clone(), generation, delivery.delivery_tag);
            let message = QueueMessage::from(delivery);
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(handler.handle(message, acker.clone()))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    error!(
                        delivery_tag = acker.delivery_tag(),
                        panic = panic_message(&*panic),
                        "Message handler panicked"
                    );
                }
                acker.done().await;
            });
        }
        trace!(generation, "Consumer loop finished");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalRoute {
    Reply,
    DeadLetter,
    Control,
    ControlLog,
}

/// Consumers the client runs for itself.
pub(crate) struct InternalHandler {
    inner: Weak<Inner>,
    route: InternalRoute,
}

impl InternalHandler {
    pub(crate) fn shared(inner: &Arc<Inner>, route: InternalRoute) -> SharedHandler {
        Arc::new(InternalHandler {
            inner: Arc::downgrade(inner),
            route,
        })
    }
}

#[async_trait]
impl QueueHandler for InternalHandler {
    async fn handle(&self, message: QueueMessage, acker: Acker) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let client = BrokerClient { inner };
        match self.route {
            InternalRoute::Reply => client.on_reply(message, acker).await,
            InternalRoute::DeadLetter => client.on_dead_letter(message, acker).await,
            InternalRoute::Control => client.on_control_message(message, acker).await,
            InternalRoute::ControlLog => {
                if let Err(e) = acker.ack(true).await {
                    debug!(error = %e, "Failed to ack log exchange message");
                }
            }
        }
    }
}
