//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popgate` application.
//!
//! It centralizes the shared error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{GatewayError, Result};
