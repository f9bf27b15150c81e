// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Largest serialized body the broker is allowed to see.
pub const MAX_MESSAGE_SIZE: usize = 130_000_000;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Invalid connection string: {0}")]
    InvalidUri(String),

    #[error("Not connected to RabbitMQ: {0}")]
    NotConnected(String),

    #[error("Broker client has been shut down")]
    Closed,

    #[error("PRECONDITION_FAILED - message size {size} is larger than configured max size {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Correlation id {0} is already waiting for a reply")]
    DuplicateCorrelationId(String),

    #[error("Exchange {0} exists with a different configuration")]
    ExchangeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Response channel was closed unexpectedly")]
    ResponseChannelClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Failures that go away once the connection has been re-established.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::NotConnected(_)
        )
    }
}

/// Mandatory setup steps whose failure makes a production process unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    ReplyQueue,
    Exchanges,
}

impl SetupFailure {
    pub fn exit_code(self) -> i32 {
        match self {
            SetupFailure::ReplyQueue => 405,
            SetupFailure::Exchanges => 406,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            SetupFailure::ReplyQueue => "cannot create reply queue",
            SetupFailure::Exchanges => "cannot create dead letter exchange and/or control exchanges",
        }
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            RabbitMQError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if lowered.contains("ack") || lowered.contains("nack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RabbitMQError::ChannelError("closed".into()).is_transient());
        assert!(RabbitMQError::NotConnected("idle".into()).is_transient());
        assert!(!RabbitMQError::Closed.is_transient());
        assert!(!RabbitMQError::PayloadTooLarge { size: 1, limit: 0 }.is_transient());
    }

    #[test]
    fn payload_error_names_the_limit() {
        let err = RabbitMQError::PayloadTooLarge {
            size: MAX_MESSAGE_SIZE + 1,
            limit: MAX_MESSAGE_SIZE,
        };
        assert_eq!(
            err.to_string(),
            "PRECONDITION_FAILED - message size 130000001 is larger than configured max size 130000000"
        );
    }

    #[test]
    fn setup_failures_map_to_exit_codes() {
        assert_eq!(SetupFailure::ReplyQueue.exit_code(), 405);
        assert_eq!(SetupFailure::Exchanges.exit_code(), 406);
    }
}
