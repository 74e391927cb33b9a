//! MQTT transport backed by rumqttc
//!
//! This module separates pure functions from I/O so the routing and option
//! logic can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure option construction, validation and QoS mapping
//! - [`message_handler`] - Pure routing of polled rumqttc events
//! - [`client`] - The connector, the client and the network task
//!
//! # Usage
//!
//! ```rust,no_run
//! use broker_link::config::ConnectionSettings;
//! use broker_link::manager::{InboundMessageBuffer, InboundSink, LinkMonitor};
//! use broker_link::transport::mqtt::RumqttcConnector;
//! use broker_link::transport::{BrokerEndpoint, TransportClient, TransportConnector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let settings = ConnectionSettings::new("localhost", 1883);
//! let sink = InboundSink::new(
//!     Arc::new(InboundMessageBuffer::new()),
//!     Arc::new(LinkMonitor::new()),
//! );
//!
//! let mut client = RumqttcConnector::new()
//!     .construct(&BrokerEndpoint::from_settings(&settings), sink)?;
//! client.connect("example-client", None, Duration::from_secs(5)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttcClient, RumqttcConnector, DEFAULT_REQUEST_CAPACITY};
pub use connection::{configure_mqtt_options, qos_for, SessionState};
pub use message_handler::{EventRoute, MessageHandler};
