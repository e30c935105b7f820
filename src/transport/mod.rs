//! The `transport` module is responsible for network communication, both
//! towards the MQTT brokers and towards HTTP clients.
//!
//! It defines the JSON envelope exchanged over MQTT, the [`Transport`] seam a
//! broker connection drives (with a `rumqttc` implementation and an
//! in-process one), and the HTTP front end.
//!
//! Inbound MQTT deliveries never touch broker state directly: a transport
//! pushes each one into the unbounded channel handed to [`Transport::connect`],
//! and the owning connection drains that channel on its own task.

pub mod http;
pub mod memory;
pub mod message;
pub mod mqtt;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

pub use rumqttc::QoS;

use crate::utils::Result;

/// A message delivered by the broker on one of our subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Inbound {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the link and subscribes to `subscriptions`. Resolves once the
    /// broker has accepted the connection; deliveries go to `inbound` until
    /// [`disconnect`](Transport::disconnect).
    async fn connect(
        &self,
        subscriptions: &[String],
        qos: QoS,
        inbound: UnboundedSender<Inbound>,
    ) -> Result<()>;

    /// Hands a payload to the client. Does not wait for delivery.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod http_tests;
