use std::collections::BTreeMap;

use rumqttc::QoS;
use serde::{Deserialize, Deserializer};

/// Top-level configuration settings for the application.
///
/// Includes the HTTP front end and every broker the gateway connects to.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub brokers: BTreeMap<String, BrokerConfig>,
}

/// Configuration settings for the HTTP front end.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Connection settings for one MQTT broker.
///
/// `broker_id` doubles as the identity topic the connection subscribes to
/// for replies addressed back to it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerConfig {
    pub broker_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub clean_session: bool,
    pub qos: u8,
    pub keepalive: u64,
    pub subscribe_topics: Vec<String>,
}

impl BrokerConfig {
    pub const DEFAULT_PORT: u16 = 1883;
    pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

    /// Minimal config used by tests and tooling.
    pub fn new(broker_id: &str, host: &str, port: u16) -> Self {
        Self {
            broker_id: broker_id.to_string(),
            host: host.to_string(),
            port,
            username: None,
            password: None,
            client_id: format!("popgate-{broker_id}"),
            clean_session: true,
            qos: 0,
            keepalive: Self::DEFAULT_KEEPALIVE_SECS,
            subscribe_topics: Vec::new(),
        }
    }

    /// Default QoS for this broker. Out-of-range levels are rejected at load
    /// time, so the fallback only matters for hand-built configs.
    pub fn qos(&self) -> QoS {
        qos_level(self.qos).unwrap_or(QoS::AtMostOnce)
    }

    /// Configured topics plus the identity topic, without duplicates.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = self.subscribe_topics.clone();
        if !topics.iter().any(|t| t == &self.broker_id) {
            topics.push(self.broker_id.clone());
        }
        topics
    }
}

pub fn qos_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub brokers: Option<BTreeMap<String, PartialBrokerConfig>>,
}

/// Partial server settings.
#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Partial broker settings, keyed by broker id in [`PartialSettings`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerConfig {
    pub broker_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub clean_session: Option<bool>,
    pub qos: Option<u8>,
    pub keepalive: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_topics")]
    pub subscribe_topics: Option<Vec<String>>,
}

impl PartialBrokerConfig {
    /// Fills in defaults. The map key is used as `broker_id` when the entry
    /// does not name one itself.
    pub fn into_config(self, key: &str) -> Result<BrokerConfig, String> {
        let broker_id = self.broker_id.unwrap_or_else(|| key.to_string());
        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| format!("broker '{broker_id}' is missing a host"))?;

        let qos = self.qos.unwrap_or(0);
        if qos_level(qos).is_none() {
            return Err(format!("broker '{broker_id}' has invalid qos {qos} (expected 0, 1 or 2)"));
        }

        let keepalive = self.keepalive.unwrap_or(BrokerConfig::DEFAULT_KEEPALIVE_SECS);
        if keepalive == 0 {
            return Err(format!("broker '{broker_id}' has a keepalive of zero"));
        }

        Ok(BrokerConfig {
            client_id: self
                .client_id
                .unwrap_or_else(|| format!("popgate-{broker_id}")),
            host,
            port: self.port.unwrap_or(BrokerConfig::DEFAULT_PORT),
            username: self.username,
            password: self.password,
            clean_session: self.clean_session.unwrap_or(true),
            qos,
            keepalive,
            subscribe_topics: self.subscribe_topics.unwrap_or_default(),
            broker_id,
        })
    }
}

/// Accepts either a list of topics or a single comma-separated string, the
/// latter being what environment variables can express.
fn deserialize_topics<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Topics {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Option::<Topics>::deserialize(deserializer)? {
        None => None,
        Some(Topics::List(list)) => Some(list),
        Some(Topics::Csv(csv)) => Some(
            csv.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
    })
}

/// Provides default values for `Settings`.
///
/// No brokers are configured by default; the gateway then serves only the
/// health endpoint.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            brokers: BTreeMap::new(),
        }
    }
}
