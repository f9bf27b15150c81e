use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Marker body carried by a synthesized timeout reply.
pub const TIMEOUT: &str = "timeout";

/// Outgoing message body.
///
/// Text goes on the wire untouched; JSON values are serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// The body that resolved an RPC call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    body: String,
}

impl Reply {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }

    /// True for both timeout shapes: the bare marker or an object whose
    /// `command` is the marker.
    pub fn is_timeout(&self) -> bool {
        if self.body == TIMEOUT {
            return true;
        }
        match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(map)) => map.get("command").and_then(Value::as_str) == Some(TIMEOUT),
            _ => false,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }
}

/// Rewrites a request body into its timeout reply.
pub fn timeout_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut map)) => {
            map.insert("command".to_string(), Value::String(TIMEOUT.to_string()));
            Value::Object(map).to_string()
        }
        _ => TIMEOUT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_bodies_keep_their_fields() {
        let body = timeout_body(r#"{"command":"query","id":7}"#);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({"command": "timeout", "id": 7}));
        assert!(Reply::new(body).is_timeout());
    }

    #[test]
    fn other_bodies_become_the_marker() {
        assert_eq!(timeout_body("hello"), "timeout");
        assert_eq!(timeout_body("[1,2]"), "timeout");
        assert_eq!(timeout_body("\"quoted\""), "timeout");
        assert!(Reply::new("timeout").is_timeout());
        assert!(!Reply::new("hello").is_timeout());
        assert!(!Reply::new(r#"{"command":"done"}"#).is_timeout());
    }

    #[test]
    fn text_payloads_are_sent_verbatim() {
        assert_eq!(Payload::from("hi").to_bytes().unwrap(), b"hi".to_vec());
        assert_eq!(
            Payload::from(json!({"a": 1})).to_bytes().unwrap(),
            br#"{"a":1}"#.to_vec()
        );
    }
}
