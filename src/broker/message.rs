//! Request/response values exchanged with the broker layer
//!
//! `Request` is what the HTTP front end (or an inbound envelope) asks a broker
//! connection to do; `Response` is what eventually comes back. Both are plain
//! immutable values identified only by their fields.
//!
//! Notes on fields:
//! - `correlation_id`: opaque string matching a response to its request
//! - `target_broker_id`: the connection that should publish/handle the request;
//!   equal to the handling connection's own id means "handle locally"
//! - `expects_reply`: `true` = request/response, `false` = fire-and-forget
//! - `status_code`: HTTP-style code reused for transport-agnostic signaling

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::utils::GatewayError;

/// Status codes carried by [`Response`].
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const INTERNAL_ERROR: u16 = 500;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub topic: String,
    pub payload: Value,
    pub correlation_id: String,
    pub target_broker_id: String,
    pub expects_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    pub payload: Value,
    pub correlation_id: String,
}

impl Response {
    pub fn new(status_code: u16, payload: Value, correlation_id: impl Into<String>) -> Self {
        Self {
            status_code,
            payload,
            correlation_id: correlation_id.into(),
        }
    }

    /// Acknowledgment returned when a request is addressed to the connection
    /// that received it.
    pub fn handled_locally(correlation_id: impl Into<String>) -> Self {
        Self::new(
            status::OK,
            json!({ "message": "Request handled locally" }),
            correlation_id,
        )
    }

    pub fn timed_out(correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        Self::from_error(
            &GatewayError::RequestTimeout(correlation_id.clone()),
            correlation_id,
        )
    }

    /// Error-carrying response whose status follows the error kind.
    pub fn from_error(err: &GatewayError, correlation_id: impl Into<String>) -> Self {
        Self::new(
            err.status_code(),
            json!({ "error": err.to_string() }),
            correlation_id,
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
