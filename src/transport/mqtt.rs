//! MQTT transport
//!
//! `rumqttc`-backed [`Transport`]. Responsibilities:
//! - build client options (client id, keepalive, clean session, credentials,
//!   packet size limit) from a [`BrokerConfig`]
//! - wait for the broker's CONNACK before reporting the connection as open
//! - run the client event loop on its own task, forwarding every incoming
//!   PUBLISH into the connection's inbound channel
//! - re-subscribe after the client reconnects on its own
//!
//! Reconnection itself is left to `rumqttc`: polling the event loop again
//! after an error starts a fresh connection attempt.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::transport::{Inbound, QoS, Transport};
use crate::utils::{GatewayError, Result};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Largest packet MQTT 3.1.1 can encode, applied in both directions.
pub const MAX_PACKET_SIZE: usize = 268_435_455;

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

pub struct MqttTransport {
    config: BrokerConfig,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    pub(crate) fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options
            .set_keep_alive(Duration::from_secs(self.config.keepalive))
            .set_clean_session(self.config.clean_session)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options
    }

    fn client(&self) -> Result<AsyncClient> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| GatewayError::NotRunning {
                broker_id: self.config.broker_id.clone(),
            })
    }

    fn transport_error(&self, cause: impl std::fmt::Display) -> GatewayError {
        GatewayError::Transport {
            broker_id: self.config.broker_id.clone(),
            reason: cause.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        subscriptions: &[String],
        qos: QoS,
        inbound: UnboundedSender<Inbound>,
    ) -> Result<()> {
        let capacity = REQUEST_CHANNEL_CAPACITY + subscriptions.len();
        let (client, mut event_loop) = AsyncClient::new(self.options(), capacity);

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut event_loop))
            .await
            .unwrap_or_else(|_| Err("timed out waiting for CONNACK".to_string()));
        if let Err(reason) = connected {
            return Err(GatewayError::ConnectFailed {
                broker_id: self.config.broker_id.clone(),
                reason,
            });
        }

        info!(
            broker = %self.config.broker_id,
            host = %self.config.host,
            port = self.config.port,
            "Connected to broker"
        );

        for topic in subscriptions {
            client
                .subscribe(topic.clone(), qos)
                .await
                .map_err(|e| self.transport_error(e))?;
            info!(broker = %self.config.broker_id, topic = %topic, "Subscribed");
        }

        let event_loop = tokio::spawn(drive(
            self.config.broker_id.clone(),
            event_loop,
            client.clone(),
            subscriptions.to_vec(),
            qos,
            inbound,
        ));

        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session { client, event_loop });
        if let Some(previous) = previous {
            previous.event_loop.abort();
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        self.client()?
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Session {
            client,
            mut event_loop,
        }) = session
        else {
            return Ok(());
        };

        let result = client.disconnect().await.map_err(|e| self.transport_error(e));

        // Let the loop flush the DISCONNECT packet before tearing it down.
        if tokio::time::timeout(DISCONNECT_GRACE, &mut event_loop)
            .await
            .is_err()
        {
            event_loop.abort();
        }
        info!(broker = %self.config.broker_id, "Disconnected from broker");
        result
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), String> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn drive(
    broker_id: String,
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    qos: QoS,
    inbound: UnboundedSender<Inbound>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Inbound::new(publish.topic, publish.payload.to_vec());
                if inbound.send(message).is_err() {
                    debug!(broker = %broker_id, "Inbound channel closed, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(broker = %broker_id, "Reconnected to broker, restoring subscriptions");
                for topic in &subscriptions {
                    if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                        warn!(broker = %broker_id, topic = %topic, error = %e, "Re-subscribe failed");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(broker = %broker_id, "Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(broker = %broker_id, error = %e, "Connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
