//! Transport layer for broker communication
//!
//! The connection manager never speaks the broker protocol itself. It drives a
//! [`TransportConnector`] to build clients and a [`TransportClient`] to perform
//! the handshake, publish and manage subscriptions. Inbound traffic flows the
//! other way through the [`InboundSink`] handed over at construction time.

use crate::config::{ConnectionSettings, Credentials, DeliveryGuarantee};
use crate::manager::subscriptions::SubscriptionRequest;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use crate::manager::buffer::InboundSink;

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub address: String,
    pub port: u16,
    pub encrypted: bool,
    pub keep_alive: Duration,
}

impl BrokerEndpoint {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            address: settings.address.clone(),
            port: settings.port,
            encrypted: settings.encrypted,
            keep_alive: settings.keep_alive(),
        }
    }
}

/// Transport capability errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Handshake rejected: {0}")]
    Handshake(String),
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Request could not be queued: {0}")]
    Request(String),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Builds transport clients for a broker endpoint
///
/// Construction only prepares the client; no network traffic happens until
/// [`TransportClient::connect`] is awaited.
pub trait TransportConnector: Send + Sync + 'static {
    type Client: TransportClient;

    fn construct(
        &self,
        endpoint: &BrokerEndpoint,
        sink: InboundSink,
    ) -> Result<Self::Client, TransportError>;
}

/// An opened (or openable) connection to the broker
///
/// Only `connect` is asynchronous. The remaining calls queue work for the
/// transport's network task and return immediately, so they are safe to call
/// from the consumer loop.
#[async_trait::async_trait]
pub trait TransportClient: Send + 'static {
    /// Perform the protocol handshake, resolving once the broker accepted it
    async fn connect(
        &mut self,
        client_id: &str,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Fire-and-forget publish
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn subscribe(&self, requests: &[SubscriptionRequest]) -> Result<(), TransportError>;

    fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    /// QoS 1/2 publishes still waiting for their final acknowledgement
    fn pending_publishes(&self) -> usize {
        0
    }

    fn disconnect(&mut self) -> Result<(), TransportError>;
}
