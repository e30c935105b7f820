//! # popgate
//!
//! `popgate` is a protocol gateway that puts an HTTP request/response surface
//! in front of a set of independent MQTT brokers, and lets those brokers
//! forward requests to each other. Every request carries a correlation id;
//! replies travel back on a topic named after the broker connection that
//! asked.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: One connection per MQTT broker, with pending-request matching and cross-broker relay.
//! - `config`: Loads settings from a file, an inline JSON variable and the environment.
//! - `service`: Starts, stops and routes requests across all broker connections.
//! - `transport`: The wire envelope, the MQTT client transport and the HTTP front end.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod broker;
pub mod config;
pub mod service;
pub mod transport;
pub mod utils;
