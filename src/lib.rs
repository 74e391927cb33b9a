//! broker-link - MQTT broker connection manager
//!
//! Keeps a single MQTT broker connection on behalf of a single-threaded
//! consumer loop (a game loop, a UI thread, a simulation step).
//!
//! # Overview
//!
//! - [`config`] loads connection settings from TOML
//! - [`manager`] drives the connection lifecycle, buffers inbound messages and
//!   dispatches them to observers once per tick
//! - [`transport`] abstracts the broker client; [`transport::mqtt`] is the
//!   rumqttc implementation
//! - [`observability`] sets up structured logging
//!
//! Network traffic is handled on tokio tasks, but every observer callback
//! fires from the consumer loop's own calls into [`ConnectionManager`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use broker_link::{BridgeConfig, ConnectionManager};
//! use broker_link::transport::mqtt::RumqttcConnector;
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::load_from_file(Path::new("broker.toml"))?;
//! let mut manager = ConnectionManager::new(config.broker, RumqttcConnector::new())?
//!     .with_runtime_section(&config.runtime);
//! manager.start();
//!
//! // From the consumer loop:
//! manager.tick();
//! manager.publish("sensor/a", "on");
//! manager.publish_f32("sensor/temperature", 21.5);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{ManagerError, ManagerResult};
pub use manager::{
    ConnectionManager, ConnectionObserver, ConnectionState, EventForwarder, LinkEvent, LinkStats,
    TickReport,
};
pub use transport::mqtt::RumqttcConnector;
