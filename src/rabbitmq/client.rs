use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use super::channel_manager::ChannelManager;
use super::connection::{ConnectionManager, ConnectionState, LifecycleEvent};
use super::control_plane::{ControlPlaneHost, NoopControlHost};
use super::dead_letter::BadQueueSet;
use super::publisher::OutboundCounters;
use super::registry::{QueueRegistration, QueueRegistry};
use super::request_response::PendingCalls;
use super::transport::{AmqpConnector, QueueOptions};
use crate::config::BrokerConfig;

pub(crate) struct Inner {
    pub(crate) config: BrokerConfig,
    pub(crate) connector: Arc<dyn AmqpConnector>,
    pub(crate) host: Arc<dyn ControlPlaneHost>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) connection: ConnectionManager,
    pub(crate) registry: QueueRegistry,
    pub(crate) pending: PendingCalls,
    pub(crate) bad_queues: BadQueueSet,
    pub(crate) counters: OutboundCounters,
    pub(crate) reply_queue: RwLock<Option<QueueRegistration>>,
    pub(crate) log_ready: AtomicBool,
}

/// Handle to one broker client instance.
///
/// Cheap to clone; every clone drives the same connection, channel, reply
/// queue and pending-call table. Create one per process at the composition
/// root and pass it to whatever needs to publish or consume.
#[derive(Clone)]
pub struct BrokerClient {
    pub(crate) inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig, connector: Arc<dyn AmqpConnector>) -> Self {
        Self::with_host(config, connector, Arc::new(NoopControlHost))
    }

    pub fn with_host(
        config: BrokerConfig,
        connector: Arc<dyn AmqpConnector>,
        host: Arc<dyn ControlPlaneHost>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                host,
                channels: Arc::new(ChannelManager::new()),
                connection: ConnectionManager::new(),
                registry: QueueRegistry::default(),
                pending: PendingCalls::default(),
                bad_queues: BadQueueSet::default(),
                counters: OutboundCounters::default(),
                reply_queue: RwLock::new(None),
                log_ready: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Lifecycle notifications. Every subscriber sees every event sent after
    /// it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.connection.subscribe()
    }

    /// Broker-assigned name of the current reply queue.
    pub fn reply_queue_name(&self) -> Option<String> {
        self.inner
            .reply_queue
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|registration| registration.queue_name.clone())
    }

    pub fn pending_call_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn outbound_message_count(&self, queue: &str) -> u64 {
        self.inner.counters.get(queue)
    }

    /// Routing keys that recently came back unroutable, oldest first.
    pub fn bad_queues(&self) -> Vec<String> {
        self.inner.bad_queues.snapshot()
    }

    /// True once the log exchange consumer is attached.
    pub fn is_log_broadcast_ready(&self) -> bool {
        self.inner.log_ready.load(Ordering::SeqCst)
    }

    /// Options used when a caller declares a queue without any: durable and
    /// dead-lettered into the configured exchange.
    pub fn default_queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: true,
            dead_letter_exchange: Some(self.inner.config.dead_letter_exchange.clone()),
            ..QueueOptions::default()
        }
    }

    pub(crate) fn set_reply_queue(&self, registration: Option<QueueRegistration>) {
        *self
            .inner
            .reply_queue
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = registration;
    }
}
