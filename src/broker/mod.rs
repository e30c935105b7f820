//! The `broker` module holds everything that happens on the gateway side of
//! an MQTT broker: one [`BrokerConnection`] per configured broker, the
//! [`BrokerRegistry`] through which connections reach each other, and the
//! request/response values they exchange.

pub mod engine;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod registry;

pub use engine::{BrokerConnection, ConnectionState, RELAY_TIMEOUT};
pub use message::{Request, Response};
pub use protocol::BrokerProtocol;
pub use registry::BrokerRegistry;
