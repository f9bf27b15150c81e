//! Reliable messaging over an AMQP broker: one supervised connection,
//! request/reply with broker-enforced timeouts through a dead-letter
//! exchange, and a fan-out control plane for cluster-wide commands.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::BrokerConfig;
pub use message::{Payload, Reply};
pub use rabbitmq::{BrokerClient, Outbound, RabbitMQError};
