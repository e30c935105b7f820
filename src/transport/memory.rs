//! In-process transport
//!
//! [`MemoryBroker`] stands in for one MQTT broker: it keeps subscriptions per
//! client and routes every publish to each matching subscription, including
//! the publisher's own (as a real broker does). [`MemoryTransport`] is the
//! [`Transport`] a broker connection uses to talk to it.
//!
//! Tests also use the broker directly to play external MQTT clients through
//! [`MemoryBroker::subscribe`] and [`MemoryBroker::publish`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::transport::{Inbound, QoS, Transport};
use crate::utils::{GatewayError, Result};

#[derive(Debug)]
struct Subscription {
    client_id: String,
    filter: String,
    sender: UnboundedSender<Inbound>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    subscriptions: Mutex<Vec<Subscription>>,
    published: Mutex<Vec<Inbound>>,
    connects: AtomicUsize,
    refuse_connections: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes `client_id` to `filter`. Subscribing the same client to the
    /// same filter again replaces the earlier subscription.
    fn add_subscription(&self, client_id: &str, filter: &str, sender: UnboundedSender<Inbound>) {
        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|s| !(s.client_id == client_id && s.filter == filter));
        subscriptions.push(Subscription {
            client_id: client_id.to_string(),
            filter: filter.to_string(),
            sender,
        });
    }

    fn remove_client(&self, client_id: &str) {
        self.subscriptions().retain(|s| s.client_id != client_id);
    }

    /// Subscription for an external client; returns its delivery queue.
    pub fn subscribe(&self, client_id: &str, filter: &str) -> UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_subscription(client_id, filter, tx);
        rx
    }

    /// Routes `payload` to every subscription whose filter matches `topic`.
    /// Subscriptions whose receiver is gone are dropped.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = Inbound::new(topic, payload);
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        self.subscriptions().retain(|s| {
            if topic_matches(&s.filter, topic) {
                s.sender.send(message.clone()).is_ok()
            } else {
                !s.sender.is_closed()
            }
        });
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<Inbound> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Inbound> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Filters `client_id` is currently subscribed to, in subscription order.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        self.subscriptions()
            .iter()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.filter.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }
}

/// MQTT topic filter matching: `+` matches exactly one level, a trailing `#`
/// matches any number of levels including none.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    client_id: String,
}

impl MemoryTransport {
    pub fn new(broker: &Arc<MemoryBroker>, client_id: &str) -> Self {
        Self {
            broker: Arc::clone(broker),
            client_id: client_id.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        subscriptions: &[String],
        _qos: QoS,
        inbound: UnboundedSender<Inbound>,
    ) -> Result<()> {
        if self.broker.refuse_connections.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectFailed {
                broker_id: self.client_id.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        for filter in subscriptions {
            self.broker
                .add_subscription(&self.client_id, filter, inbound.clone());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<()> {
        self.broker.publish(topic, payload);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.remove_client(&self.client_id);
        Ok(())
    }
}
