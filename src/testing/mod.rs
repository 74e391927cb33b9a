//! Testing utilities and mock implementations
//!
//! This module provides a mock transport and observer for exercising the
//! connection manager without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
