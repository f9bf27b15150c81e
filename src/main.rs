use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_rpc::config::{self, BrokerConfig};
use rabbit_rpc::rabbitmq::{BrokerClient, ControlPlaneHost, LapinConnector, RabbitMQError};

/// Control host for a standalone process: an in-memory cache and the
/// housekeeping clock.
#[derive(Default)]
struct ProcessHost {
    cache: Mutex<HashMap<String, String>>,
    last_housekeeping: Mutex<Option<DateTime<Utc>>>,
}

#[async_trait]
impl ControlPlaneHost for ProcessHost {
    async fn clear_cache(&self, reason: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        info!(reason, entries = cache.len(), "Clearing cache");
        cache.clear();
    }

    async fn delete_cache_key(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if cache.remove(key).is_some() {
            info!(key, "Evicted cache key");
        }
    }

    fn last_housekeeping(&self) -> Option<DateTime<Utc>> {
        *self.last_housekeeping.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_last_housekeeping(&self, at: DateTime<Utc>) {
        *self.last_housekeeping.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }
}

fn load_settings() -> anyhow::Result<BrokerConfig> {
    match config::load_config() {
        Ok(config) => Ok(config),
        Err(file_error) => {
            info!(reason = %file_error, "No config file, reading environment");
            BrokerConfig::from_env().context("Failed to load broker configuration")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let client = BrokerClient::with_host(
        settings,
        Arc::new(LapinConnector::new()),
        Arc::new(ProcessHost::default()),
    );

    match client.connect().await {
        Ok(()) => {}
        Err(RabbitMQError::InvalidUri(reason)) => {
            anyhow::bail!("Cannot connect to RabbitMQ: {}", reason);
        }
        Err(e) => warn!(error = %e, "Initial connect failed, retrying in background"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    client.shutdown().await;
    Ok(())
}
