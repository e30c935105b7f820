//! The `service` module coordinates all broker connections of one gateway
//! process.

pub mod manager;

pub use manager::{ROUTE_TIMEOUT, ServiceManager, TransportFactory};
