//! The `error` module defines the error type shared by every layer of `popgate`.
//!
//! Each variant maps onto an HTTP-style status code so that failures deep in
//! the broker layer can be turned into a [`Response`](crate::broker::message::Response)
//! without losing their meaning at the HTTP boundary.

use thiserror::Error;

use crate::broker::message::status;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("broker connection '{broker_id}' is not running")]
    NotRunning { broker_id: String },

    #[error("broker not found: {0}")]
    BrokerNotFound(String),

    #[error("no target broker specified")]
    NoTargetSpecified,

    #[error("request timed out for correlation id {0}")]
    RequestTimeout(String),

    #[error("request cancelled for correlation id {0}")]
    Cancelled(String),

    #[error("Failed to route to broker: {target}: {reason}")]
    RoutingFailure { target: String, reason: String },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("failed to connect to broker '{broker_id}': {reason}")]
    ConnectFailed { broker_id: String, reason: String },

    #[error("transport error on broker '{broker_id}': {reason}")]
    Transport { broker_id: String, reason: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{phase} failed for {}", summarize(.failures))]
    Aggregate {
        phase: &'static str,
        failures: Vec<(String, GatewayError)>,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Wraps any failure met while relaying towards `target`.
    pub fn routing(target: &str, cause: impl std::fmt::Display) -> Self {
        GatewayError::RoutingFailure {
            target: target.to_string(),
            reason: cause.to_string(),
        }
    }

    /// HTTP-style status code used when this error is surfaced as a response.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NoTargetSpecified => status::BAD_REQUEST,
            GatewayError::BrokerNotFound(_) => status::NOT_FOUND,
            GatewayError::RequestTimeout(_) => status::REQUEST_TIMEOUT,
            _ => status::INTERNAL_ERROR,
        }
    }
}

fn summarize(failures: &[(String, GatewayError)]) -> String {
    failures
        .iter()
        .map(|(broker_id, err)| format!("{broker_id} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}
