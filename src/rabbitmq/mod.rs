// src/rabbitmq/mod.rs
// Broker client: connection lifecycle, consumers, RPC and the control plane

pub mod errors;
pub mod transport;
pub mod amqp_client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

mod channel_manager;
mod client;
mod connection;
mod consumer;
mod control_plane;
mod dead_letter;
mod publisher;
mod registry;
mod request_response;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinConnector;
pub use client::BrokerClient;
pub use connection::{ConnectionState, LifecycleEvent};
pub use consumer::{handler, Acker, QueueHandler, QueueMessage, QueueMessageOptions, SharedHandler};
pub use control_plane::{
    ControlCommand, ControlPlaneHost, FrontDoorClient, NoopControlHost, OF_EXCHANGE, OF_LOG_EXCHANGE,
};
pub use dead_letter::{BadQueueSet, BAD_QUEUE_CAPACITY};
pub use errors::{RabbitMQError, Result, SetupFailure, MAX_MESSAGE_SIZE};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use publisher::Outbound;
pub use registry::{ExchangeRegistration, QueueRegistration};
pub use request_response::ReplyHandle;
pub use transport::{ExchangeAlgorithm, ExchangeOptions, QueueOptions};
