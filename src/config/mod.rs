mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File, FileFormat};
use tracing::info;

pub use settings::{BrokerConfig, ServerSettings, Settings, qos_level};

/// Environment variable holding a whole configuration document as JSON.
pub const INLINE_CONFIG_VAR: &str = "MQTT_CONFIG_JSON";

/// Prefix for per-key environment overrides, e.g. `POPGATE_SERVER__PORT`.
pub const ENV_PREFIX: &str = "POPGATE";

/// Loads the configuration from `path` (format chosen by extension), the
/// inline JSON variable and `POPGATE_*` environment variables, in that order
/// of increasing precedence.
/// Merges the configuration with default values.
pub fn load_config(path: &str) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder().add_source(File::with_name(path).required(false));

    if let Ok(inline) = std::env::var(INLINE_CONFIG_VAR) {
        info!("Loading inline configuration from {INLINE_CONFIG_VAR}");
        builder = builder.add_source(File::from_str(&inline, FileFormat::Json));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let mut brokers = std::collections::BTreeMap::new();
    for (key, broker) in partial.brokers.unwrap_or_default() {
        let broker = broker.into_config(&key).map_err(ConfigError::Message)?;
        brokers.insert(broker.broker_id.clone(), broker);
    }

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        brokers,
    })
}
