use std::env;

use dotenv::dotenv;

use crate::config::BrokerConfig;
use crate::rabbitmq::errors::{RabbitMQError, Result};

impl BrokerConfig {
    /// Reads the settings from the process environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("AMQP_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| RabbitMQError::ConfigError("AMQP_URL is not set".to_string()))?;

        let mut config = BrokerConfig::new(url);
        if let Some(dlx) = lookup("AMQP_DLX").filter(|value| !value.is_empty()) {
            config.dead_letter_exchange = dlx;
        }
        if let Some(value) = lookup("AMQP_DEFAULT_EXPIRATION") {
            config.default_expiration_ms = parse("AMQP_DEFAULT_EXPIRATION", &value)?;
        }
        if let Some(value) = lookup("AMQP_PREFETCH") {
            config.prefetch = parse("AMQP_PREFETCH", &value)?;
        }
        if let Some(value) = lookup("AMQP_RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = parse("AMQP_RECONNECT_DELAY_MS", &value)?;
        }
        if let Some(value) = lookup("NODE_ENV") {
            config.environment = value;
        }
        if let Some(value) = lookup("ENABLE_OPENFLOW_AMQP") {
            config.enable_control_broadcast = parse_flag(&value);
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RabbitMQError::ConfigError(format!("{} has an invalid value: {}", key, value)))
}

fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off" | "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[("AMQP_URL", "amqp://localhost")])).unwrap();
        assert_eq!(config.dead_letter_exchange, "openflow-dlx");
        assert_eq!(config.default_expiration_ms, 60_000);
        assert_eq!(config.prefetch, 25);
        assert!(config.enable_control_broadcast);
    }

    #[test]
    fn test_config_overrides() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("AMQP_URL", "amqps://broker:5671"),
            ("AMQP_DLX", "dead"),
            ("AMQP_DEFAULT_EXPIRATION", "1500"),
            ("AMQP_PREFETCH", "50"),
            ("NODE_ENV", "production"),
            ("ENABLE_OPENFLOW_AMQP", "false"),
        ]))
        .unwrap();
        assert_eq!(config.url, "amqps://broker:5671");
        assert_eq!(config.dead_letter_exchange, "dead");
        assert_eq!(config.default_expiration_ms, 1500);
        assert_eq!(config.prefetch, 50);
        assert!(config.is_production());
        assert!(!config.enable_control_broadcast);
    }

    #[test]
    fn test_config_errors() {
        assert!(BrokerConfig::from_lookup(lookup(&[])).is_err());
        let result = BrokerConfig::from_lookup(lookup(&[
            ("AMQP_URL", "amqp://localhost"),
            ("AMQP_PREFETCH", "many"),
        ]));
        assert!(matches!(result, Err(RabbitMQError::ConfigError(_))));
    }
}
