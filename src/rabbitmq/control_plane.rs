//! Cluster-wide control commands.
//!
//! Every instance binds its own queue to the fan-out [`OF_EXCHANGE`] and acts
//! on what it receives through a [`ControlPlaneHost`]. The log exchange
//! carries nothing actionable; attaching to it marks the instance
//! log-broadcast ready.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, trace, warn};

use super::client::BrokerClient;
use super::consumer::{Acker, QueueMessage};
use super::errors::Result;
use super::publisher::Outbound;
use crate::message::Payload;

pub const OF_EXCHANGE: &str = "openflow";
pub const OF_LOG_EXCHANGE: &str = "openflow_logs";

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Evict one key, or the whole cache when `key` is `None`.
    ClearCache { key: Option<String> },
    /// Without `last_run` this asks whoever knows the last run to repeat it.
    Housekeeping { last_run: Option<DateTime<Utc>> },
    HeapDump,
    Shutdown,
    DumpWebsocketClients,
    /// `message` is the whole command object.
    NotifyWebsocketClients { message: Value },
    KillWebsocketClient { id: String },
    Unknown(String),
}

fn non_empty_str(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl ControlCommand {
    /// Parses a wire body. `None` for anything that is not a JSON object.
    pub fn parse(body: &str) -> Option<ControlCommand> {
        let value: Value = serde_json::from_str(body).ok()?;
        let Value::Object(map) = &value else {
            return None;
        };
        let name = map.get("command").and_then(Value::as_str).unwrap_or_default();
        let command = match name {
            "clearcache" => ControlCommand::ClearCache {
                key: non_empty_str(map, "key"),
            },
            "housekeeping" => ControlCommand::Housekeeping {
                last_run: non_empty_str(map, "lastrun").and_then(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|at| at.with_timezone(&Utc))
                        .map_err(|e| debug!(lastrun = %raw, error = %e, "Ignoring malformed lastrun"))
                        .ok()
                }),
            },
            "heapdump" => ControlCommand::HeapDump,
            "shutdown" => ControlCommand::Shutdown,
            "dumpwebsocketclients" => ControlCommand::DumpWebsocketClients,
            "notifywebsocketclients" => ControlCommand::NotifyWebsocketClients {
                message: value.clone(),
            },
            "killwebsocketclient" => match non_empty_str(map, "id") {
                Some(id) => ControlCommand::KillWebsocketClient { id },
                None => ControlCommand::Unknown(name.to_string()),
            },
            other => ControlCommand::Unknown(other.to_string()),
        };
        Some(command)
    }

    pub fn name(&self) -> &str {
        match self {
            ControlCommand::ClearCache { .. } => "clearcache",
            ControlCommand::Housekeeping { .. } => "housekeeping",
            ControlCommand::HeapDump => "heapdump",
            ControlCommand::Shutdown => "shutdown",
            ControlCommand::DumpWebsocketClients => "dumpwebsocketclients",
            ControlCommand::NotifyWebsocketClients { .. } => "notifywebsocketclients",
            ControlCommand::KillWebsocketClient { .. } => "killwebsocketclient",
            ControlCommand::Unknown(name) => name,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = match self {
            ControlCommand::NotifyWebsocketClients {
                message: Value::Object(map),
            } => map.clone(),
            _ => Map::new(),
        };
        map.insert("command".to_string(), Value::String(self.name().to_string()));
        match self {
            ControlCommand::ClearCache { key: Some(key) } => {
                map.insert("key".to_string(), Value::String(key.clone()));
            }
            ControlCommand::Housekeeping { last_run: Some(at) } => {
                map.insert(
                    "lastrun".to_string(),
                    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
            ControlCommand::KillWebsocketClient { id } => {
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            _ => {}
        }
        Value::Object(map)
    }
}

/// A front-door connection held by this process.
#[async_trait]
pub trait FrontDoorClient: Send + Sync {
    fn id(&self) -> &str;

    fn describe(&self) -> String {
        self.id().to_string()
    }

    async fn notify(&self, message: &Value);

    async fn close(&self);
}

/// Process-local collaborators the control commands act on.
#[async_trait]
pub trait ControlPlaneHost: Send + Sync {
    async fn clear_cache(&self, _reason: &str) {}

    async fn delete_cache_key(&self, _key: &str) {}

    fn last_housekeeping(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn set_last_housekeeping(&self, _at: DateTime<Utc>) {}

    async fn heap_dump(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Orderly shutdown of storage and telemetry.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn exit(&self, code: i32) {
        std::process::exit(code)
    }

    fn clients(&self) -> Vec<Arc<dyn FrontDoorClient>> {
        Vec::new()
    }
}

/// Ignores every command. Exits still end the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControlHost;

impl ControlPlaneHost for NoopControlHost {}

impl BrokerClient {
    /// Publishes `command` to every instance, this one included.
    pub async fn broadcast(&self, command: &ControlCommand) -> Result<()> {
        let outbound = Outbound::to_exchange(OF_EXCHANGE, "", Payload::Json(command.to_json()))
            .with_expiration(self.inner.config.control_expiration_ms as i64);
        self.send(outbound).await
    }

    pub(crate) async fn on_control_message(&self, message: QueueMessage, acker: Acker) {
        if let Err(e) = acker.ack(true).await {
            warn!(error = %e, "Failed to ack control message");
        }
        match ControlCommand::parse(&message.body) {
            Some(command) => {
                debug!(exchange = %message.options.exchange_name, command = command.name(), "Received command");
                self.dispatch_control(command).await;
            }
            None => trace!(body = %message.body, "Received non-command control message"),
        }
    }

    /// Runs one control command against the host.
    pub async fn dispatch_control(&self, command: ControlCommand) {
        let host = &self.inner.host;
        match command {
            ControlCommand::ClearCache { key: None } => host.clear_cache("amqp broadcast").await,
            ControlCommand::ClearCache { key: Some(key) } => host.delete_cache_key(&key).await,
            ControlCommand::Housekeeping { last_run: Some(at) } => {
                debug!(lastrun = %at, "Housekeeping ran elsewhere");
                host.set_last_housekeeping(at);
            }
            ControlCommand::Housekeeping { last_run: None } => {
                if let Some(at) = host.last_housekeeping() {
                    let answer = ControlCommand::Housekeeping { last_run: Some(at) };
                    if let Err(e) = self.broadcast(&answer).await {
                        warn!(error = %e, "Failed to broadcast last housekeeping");
                    }
                }
            }
            ControlCommand::HeapDump => {
                if let Err(e) = host.heap_dump().await {
                    error!(error = %e, "Heap dump failed");
                }
            }
            ControlCommand::Shutdown => self.run_shutdown_command().await,
            ControlCommand::DumpWebsocketClients => {
                let clients = host.clients();
                info!(count = clients.len(), "Front door clients");
                for client in clients {
                    info!(client = %client.describe(), "Front door client");
                }
            }
            ControlCommand::NotifyWebsocketClients { message } => {
                for client in host.clients() {
                    client.notify(&message).await;
                }
            }
            ControlCommand::KillWebsocketClient { id } => {
                for client in host.clients().iter().rev() {
                    if client.id() == id {
                        warn!(client = %id, "Killing front door client");
                        client.close().await;
                    }
                }
            }
            ControlCommand::Unknown(name) => {
                error!(command = %name, "[OF] Received unknown command");
            }
        }
    }

    async fn run_shutdown_command(&self) {
        let host = Arc::clone(&self.inner.host);
        let grace = self.inner.config.shutdown_grace();
        let fallback = Arc::clone(&host);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            warn!("Orderly shutdown did not finish in time, forcing exit");
            fallback.exit(0);
        });

        info!("Shutdown requested over control exchange");
        match host.shutdown().await {
            Ok(()) => host.exit(0),
            Err(e) => {
                error!(error = %e, "Orderly shutdown failed");
                host.exit(404);
            }
        }
    }
}
