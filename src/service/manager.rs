//! Service manager
//!
//! Builds one [`BrokerConnection`] per configured broker, wires them all into
//! a shared [`BrokerRegistry`] and routes requests coming from the HTTP front
//! end to the connection they name.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnection, BrokerProtocol, BrokerRegistry, Request, Response};
use crate::config::{BrokerConfig, Settings};
use crate::transport::Transport;
use crate::transport::mqtt::MqttTransport;
use crate::utils::{GatewayError, Result};

/// Deadline for requests routed from the HTTP front end.
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces the transport a new connection drives.
pub type TransportFactory = Box<dyn Fn(&BrokerConfig) -> Arc<dyn Transport> + Send + Sync>;

pub struct ServiceManager {
    brokers: Vec<BrokerConfig>,
    registry: Arc<BrokerRegistry>,
    connections: Vec<BrokerConnection>,
    transport_factory: TransportFactory,
}

impl ServiceManager {
    /// Manager whose connections talk MQTT over the network.
    pub fn new(brokers: Vec<BrokerConfig>) -> Self {
        Self::with_transport_factory(brokers, |config: &BrokerConfig| -> Arc<dyn Transport> {
            Arc::new(MqttTransport::new(config.clone()))
        })
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.brokers.values().cloned().collect())
    }

    pub fn with_transport_factory<F>(brokers: Vec<BrokerConfig>, factory: F) -> Self
    where
        F: Fn(&BrokerConfig) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        Self {
            brokers,
            registry: Arc::new(BrokerRegistry::new()),
            connections: Vec::new(),
            transport_factory: Box::new(factory),
        }
    }

    /// Creates and registers a connection for every configured broker, then
    /// starts them all concurrently.
    ///
    /// Connections that start keep running even when others fail; the
    /// failures are returned together as [`GatewayError::Aggregate`].
    pub async fn initialize(&mut self) -> Result<()> {
        if !self.connections.is_empty() {
            warn!("Service manager already initialized");
            return Ok(());
        }

        for config in &self.brokers {
            let transport = (self.transport_factory)(config);
            let connection = BrokerConnection::new(config.clone(), transport, &self.registry);
            self.registry
                .register(&config.broker_id, Arc::new(connection.clone()));
            self.connections.push(connection);
        }

        let results = join_all(self.connections.iter().map(|c| c.start())).await;
        let failures = collect_failures(&self.connections, results);
        info!(
            started = self.connections.len() - failures.len(),
            failed = failures.len(),
            "Initialized broker connections"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Aggregate {
                phase: "startup",
                failures,
            })
        }
    }

    /// Stops every connection. Each one is attempted even if others fail.
    pub async fn shutdown(&self) -> Result<()> {
        let results = join_all(self.connections.iter().map(|c| c.stop())).await;
        let failures = collect_failures(&self.connections, results);
        info!(
            stopped = self.connections.len() - failures.len(),
            "Shut down broker connections"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Aggregate {
                phase: "shutdown",
                failures,
            })
        }
    }

    /// Routes a request to the connection named by `target_broker_id`.
    ///
    /// Requests expecting a reply wait at most [`ROUTE_TIMEOUT`];
    /// fire-and-forget requests are published as-is and yield `None`.
    /// Failures come back as error-carrying responses.
    pub async fn route_request(&self, request: Request) -> Option<Response> {
        let Request {
            topic,
            payload,
            correlation_id,
            target_broker_id,
            expects_reply,
        } = request;

        if target_broker_id.is_empty() {
            warn!(topic = %topic, "Rejecting request without target broker");
            return Some(Response::from_error(
                &GatewayError::NoTargetSpecified,
                correlation_id,
            ));
        }

        let target = match self.registry.get(&target_broker_id) {
            Ok(target) => target,
            Err(e) => {
                warn!(target_broker = %target_broker_id, topic = %topic, "Unknown target broker");
                return Some(Response::from_error(&e, correlation_id));
            }
        };

        if !expects_reply {
            return match target.publish(&topic, &payload, None).await {
                Ok(()) => {
                    info!(target_broker = %target_broker_id, topic = %topic, "Published fire-and-forget request");
                    None
                }
                Err(e) => {
                    error!(target_broker = %target_broker_id, topic = %topic, error = %e, "Failed to publish request");
                    Some(Response::from_error(&e, correlation_id))
                }
            };
        }

        let correlation_id = if correlation_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            correlation_id
        };
        info!(
            target_broker = %target_broker_id,
            topic = %topic,
            correlation_id = %correlation_id,
            "Routing request"
        );
        match target
            .request(&topic, payload, &correlation_id, ROUTE_TIMEOUT)
            .await
        {
            Ok(response) => Some(response),
            Err(e) => {
                error!(
                    target_broker = %target_broker_id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Request failed"
                );
                Some(Response::from_error(&e, correlation_id))
            }
        }
    }

    pub fn registered_broker_ids(&self) -> Vec<String> {
        self.registry.list_ids()
    }

    pub fn connection(&self, broker_id: &str) -> Result<Arc<dyn BrokerProtocol>> {
        self.registry.get(broker_id)
    }
}

fn collect_failures(
    connections: &[BrokerConnection],
    results: Vec<Result<()>>,
) -> Vec<(String, GatewayError)> {
    connections
        .iter()
        .zip(results)
        .filter_map(|(connection, result)| {
            result
                .err()
                .map(|e| (connection.identifier().to_string(), e))
        })
        .collect()
}
