use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::message::Response;
use crate::transport::QoS;
use crate::utils::Result;

/// Capabilities of one broker connection, as seen by the registry, the relay
/// logic of other connections and the service manager.
#[async_trait]
pub trait BrokerProtocol: Send + Sync {
    /// Broker id; also the topic this connection receives replies on.
    fn identifier(&self) -> &str;

    /// Default QoS for publishes on this broker.
    fn qos(&self) -> QoS;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Publishes `payload` as-is. `qos` falls back to [`qos`](Self::qos).
    async fn publish(&self, topic: &str, payload: &Value, qos: Option<QoS>) -> Result<()>;

    /// Publishes `payload` wrapped in an envelope and waits for the reply
    /// carrying the same correlation id, at most `timeout`.
    async fn request(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Response>;
}
