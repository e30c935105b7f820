//! Wire envelope
//!
//! Every MQTT payload the gateway produces or consumes on behalf of a
//! request is a JSON object of this shape:
//!
//! ```json
//! { "identifier": "<sender broker id>",
//!   "payload": { ... },
//!   "correlation_id": "<string>",
//!   "target_broker_id": "<string, optional>",
//!   "is_response": true,
//!   "status_code": 200 }
//! ```
//!
//! `identifier` is also the topic the sender listens on for replies. The
//! `is_response` flag marks a request that expects a reply; the name is kept
//! for wire compatibility with existing clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::broker::message::{Request, Response, status};
use crate::utils::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_broker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    /// The wrapped form `request()` publishes: sender identity, payload and
    /// correlation id only.
    pub fn request(identifier: &str, payload: Value, correlation_id: &str) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            payload,
            correlation_id: Some(correlation_id.to_string()),
            target_broker_id: None,
            is_response: None,
            status_code: None,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| GatewayError::MalformedEnvelope(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this envelope was sent by the broker identified by `broker_id`.
    pub fn is_from(&self, broker_id: &str) -> bool {
        self.identifier.as_deref() == Some(broker_id)
    }

    /// Response resolving a pending request. Missing status means success.
    pub fn into_response(self, correlation_id: String) -> Response {
        Response::new(
            self.status_code.unwrap_or(status::OK),
            self.payload,
            correlation_id,
        )
    }

    /// New inbound request received on `topic`. Without a target the request
    /// is handled locally; without the reply flag it is fire-and-forget.
    pub fn into_request(self, topic: &str) -> Request {
        Request {
            topic: topic.to_string(),
            payload: self.payload,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            target_broker_id: self.target_broker_id.unwrap_or_default(),
            expects_reply: self.is_response.unwrap_or(false),
        }
    }
}
