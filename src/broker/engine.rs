//! Broker connection engine
//!
//! A `BrokerConnection` owns one link to one MQTT broker and is responsible for:
//! - the connect/subscribe lifecycle (configured topics plus the identity
//!   topic named after its own broker id)
//! - classifying every inbound message as either the reply to a pending
//!   `request()` or a new request
//! - the pending waiter table behind `request()`
//! - relaying new requests to the connection they are addressed to, and
//!   publishing the downstream reply back to the original sender
//!
//! Concurrency and usage notes:
//! - The transport pushes deliveries into an unbounded channel; a single
//!   dispatcher task per connection drains it. All waiter resolution happens
//!   on that task, and relay work is spawned from it so the dispatcher never
//!   waits on another broker.
//! - The waiter table lock is never held across an `.await`. A waiter is
//!   resolved while the lock is held, which makes removal-on-timeout and
//!   resolution mutually exclusive.
//! - `BrokerConnection` is a cheap handle; clones share the same connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::broker::message::{Request, Response};
use crate::broker::pending::{PendingRequest, Settled, WaiterTable};
use crate::broker::protocol::BrokerProtocol;
use crate::broker::registry::BrokerRegistry;
use crate::config::BrokerConfig;
use crate::transport::message::Envelope;
use crate::transport::{Inbound, QoS, Transport};
use crate::utils::{GatewayError, Result};

/// Deadline for the downstream `request()` a relay issues on the target.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Running,
}

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    registry: Weak<BrokerRegistry>,
    state: Mutex<ConnectionState>,
    waiters: Mutex<WaiterTable>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        registry: &Arc<BrokerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry: Arc::downgrade(registry),
                state: Mutex::new(ConnectionState::Stopped),
                waiters: Mutex::new(WaiterTable::new()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn waiters(&self) -> MutexGuard<'_, WaiterTable> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `request()` calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.waiters().len()
    }

    pub fn has_waiter(&self, correlation_id: &str) -> bool {
        self.waiters().contains(correlation_id)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == ConnectionState::Running {
            Ok(())
        } else {
            Err(GatewayError::NotRunning {
                broker_id: self.identifier().to_string(),
            })
        }
    }

    async fn send(&self, topic: &str, bytes: Vec<u8>, qos: QoS) -> Result<()> {
        self.ensure_running()?;
        self.inner.transport.publish(topic, bytes, qos).await
    }

    async fn send_envelope(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        self.send(topic, bytes, self.qos()).await
    }

    /// Classifies one inbound delivery. Runs on the dispatcher task.
    fn dispatch(&self, inbound: Inbound) {
        let envelope = match Envelope::decode(&inbound.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    broker = %self.identifier(),
                    topic = %inbound.topic,
                    error = %e,
                    "Dropping undecodable message"
                );
                return;
            }
        };

        // Our own publishes echo back on topics we subscribe to.
        if envelope.is_from(self.identifier()) {
            trace!(broker = %self.identifier(), topic = %inbound.topic, "Ignoring own message");
            return;
        }
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            trace!(broker = %self.identifier(), topic = %inbound.topic, "Ignoring message without correlation id");
            return;
        };

        {
            let mut waiters = self.waiters();
            if let Some(waiter) = waiters.take(&correlation_id) {
                let response = envelope.into_response(correlation_id.clone());
                if !waiter.settle(Settled::Response(response)) {
                    debug!(
                        broker = %self.identifier(),
                        correlation_id = %correlation_id,
                        "Requester went away before its response arrived"
                    );
                }
                return;
            }
        }

        let origin = envelope.identifier.clone().unwrap_or_default();
        let request = envelope.into_request(&inbound.topic);
        info!(
            broker = %self.identifier(),
            topic = %request.topic,
            target_broker = %request.target_broker_id,
            correlation_id = %request.correlation_id,
            "Received request"
        );

        let connection = self.clone();
        tokio::spawn(async move {
            if let Some(response) = connection.handle_message(&origin, request).await {
                debug!(
                    broker = %connection.identifier(),
                    status = response.status_code,
                    correlation_id = %response.correlation_id,
                    "Request handled"
                );
            }
        });
    }

    /// Handles a new inbound request sent by `origin`: either locally, or by
    /// relaying it to the connection named in `target_broker_id`.
    ///
    /// Returns the downstream response for relayed requests that expect a
    /// reply, the local acknowledgment for local ones, an error response when
    /// routing fails, and `None` for fire-and-forget forwards.
    pub async fn handle_message(&self, origin: &str, request: Request) -> Option<Response> {
        if request.target_broker_id.is_empty() || request.target_broker_id == self.identifier() {
            debug!(
                broker = %self.identifier(),
                correlation_id = %request.correlation_id,
                "Handling request locally"
            );
            return Some(Response::handled_locally(request.correlation_id));
        }

        info!(
            broker = %self.identifier(),
            target_broker = %request.target_broker_id,
            "Routing request to target broker"
        );
        match self.route_to_target(origin, &request).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    broker = %self.identifier(),
                    target_broker = %request.target_broker_id,
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "Error routing to target broker"
                );
                Some(Response::from_error(&e, request.correlation_id))
            }
        }
    }

    async fn route_to_target(&self, origin: &str, request: &Request) -> Result<Option<Response>> {
        let target_id = request.target_broker_id.as_str();
        let registry = self
            .inner
            .registry
            .upgrade()
            .ok_or_else(|| GatewayError::routing(target_id, "broker registry is gone"))?;
        let target = registry
            .get(target_id)
            .map_err(|e| GatewayError::routing(target_id, e))?;

        if !request.expects_reply {
            target
                .publish(&request.topic, &request.payload, Some(target.qos()))
                .await
                .map_err(|e| GatewayError::routing(target_id, e))?;
            info!(
                target_broker = %target_id,
                topic = %request.topic,
                "Forwarded request to target broker"
            );
            return Ok(None);
        }

        let response = target
            .request(
                &request.topic,
                request.payload.clone(),
                &request.correlation_id,
                RELAY_TIMEOUT,
            )
            .await
            .map_err(|e| GatewayError::routing(target_id, e))?;
        info!(
            target_broker = %target_id,
            status = response.status_code,
            correlation_id = %response.correlation_id,
            "Received response from target broker"
        );

        self.publish(origin, &response.payload, Some(self.qos()))
            .await
            .map_err(|e| GatewayError::routing(target_id, e))?;
        info!(
            broker = %self.identifier(),
            topic = %origin,
            "Published response back to origin"
        );
        Ok(Some(response))
    }
}

#[async_trait]
impl BrokerProtocol for BrokerConnection {
    fn identifier(&self) -> &str {
        &self.inner.config.broker_id
    }

    fn qos(&self) -> QoS {
        self.inner.config.qos()
    }

    async fn start(&self) -> Result<()> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Stopped {
                debug!(broker = %self.identifier(), state = ?*state, "Connection already started");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let subscriptions = self.inner.config.subscriptions();
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .inner
            .transport
            .connect(&subscriptions, self.qos(), tx)
            .await
        {
            self.set_state(ConnectionState::Stopped);
            error!(broker = %self.identifier(), error = %e, "Failed to start broker connection");
            return Err(e);
        }

        let stopped_while_connecting = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Running;
                false
            } else {
                true
            }
        };
        if stopped_while_connecting {
            info!(broker = %self.identifier(), "Stop requested while connecting, disconnecting");
            self.inner.transport.disconnect().await?;
            return Err(GatewayError::NotRunning {
                broker_id: self.identifier().to_string(),
            });
        }

        let connection = self.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                connection.dispatch(inbound);
            }
        });
        let previous = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(dispatcher);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(
            broker = %self.identifier(),
            host = %self.inner.config.host,
            port = self.inner.config.port,
            topics = ?subscriptions,
            "Started broker connection"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Running => *state = ConnectionState::Stopped,
                ConnectionState::Connecting => {
                    // start() sees this once its connect attempt returns.
                    *state = ConnectionState::Stopped;
                    debug!(broker = %self.identifier(), "Stop recorded for connecting connection");
                    return Ok(());
                }
                ConnectionState::Stopped => {
                    debug!(broker = %self.identifier(), "Connection not running");
                    return Ok(());
                }
            }
        }

        let waiters = self.waiters().drain();
        let cancelled = waiters.len();
        for waiter in waiters {
            waiter.settle(Settled::Cancelled);
        }

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        let result = self.inner.transport.disconnect().await;
        info!(broker = %self.identifier(), cancelled, "Stopped broker connection");
        result
    }

    async fn publish(&self, topic: &str, payload: &Value, qos: Option<QoS>) -> Result<()> {
        self.ensure_running()?;
        let bytes = serde_json::to_vec(payload)?;
        self.send(topic, bytes, qos.unwrap_or_else(|| self.qos()))
            .await
    }

    async fn request(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Response> {
        self.ensure_running()?;

        let mut pending = PendingRequest::register(&self.inner.waiters, correlation_id);
        let envelope = Envelope::request(self.identifier(), payload, correlation_id);
        if let Err(e) = self.send_envelope(topic, envelope).await {
            pending.release();
            error!(
                broker = %self.identifier(),
                correlation_id = %correlation_id,
                error = %e,
                "Error while sending request"
            );
            return Ok(Response::from_error(&e, correlation_id));
        }

        let deadline = Instant::now() + timeout;
        let outcome = tokio::time::timeout_at(deadline, pending.receiver()).await;
        let settled = match outcome {
            Ok(Ok(settled)) => Some(settled),
            Ok(Err(_)) => {
                // A later request() took over this correlation id; only the
                // deadline can end this call now.
                debug!(
                    broker = %self.identifier(),
                    correlation_id = %correlation_id,
                    "Waiter replaced by a newer request"
                );
                tokio::time::sleep_until(deadline).await;
                None
            }
            Err(_) => pending.expire(),
        };

        match settled {
            Some(Settled::Response(response)) => Ok(response),
            Some(Settled::Cancelled) => Err(GatewayError::Cancelled(correlation_id.to_string())),
            None => {
                warn!(broker = %self.identifier(), correlation_id = %correlation_id, "Request timed out");
                Ok(Response::timed_out(correlation_id))
            }
        }
    }
}
