//! Pure connection configuration for the rumqttc transport
//!
//! This module contains pure functions for endpoint validation, option
//! construction and QoS mapping, plus the session state shared with the
//! network task.

use crate::config::{Credentials, DeliveryGuarantee};
use crate::transport::{BrokerEndpoint, TransportError};
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};

/// Handshake progress as observed by the network task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// CONNECT sent (or about to be), waiting for CONNACK
    Handshaking,
    /// CONNACK accepted
    Open,
    /// The network task stopped, with the reason
    Closed(String),
}

/// Map a delivery guarantee onto the rumqttc QoS level
pub fn qos_for(guarantee: DeliveryGuarantee) -> QoS {
    match guarantee {
        DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
        DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryGuarantee::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Reject endpoints rumqttc cannot open
pub fn validate_endpoint(endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
    let address = endpoint.address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidEndpoint(
            "broker address is empty".to_string(),
        ));
    }
    if address.chars().any(char::is_whitespace) {
        return Err(TransportError::InvalidEndpoint(format!(
            "broker address '{address}' contains whitespace"
        )));
    }
    if endpoint.port == 0 {
        return Err(TransportError::InvalidEndpoint(
            "broker port must not be 0".to_string(),
        ));
    }
    Ok(())
}

/// Reject client ids rumqttc would refuse
pub fn validate_client_id(client_id: &str) -> Result<(), TransportError> {
    if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
        return Err(TransportError::Handshake(format!(
            "invalid client id '{client_id}'"
        )));
    }
    Ok(())
}

/// Build rumqttc options for one handshake
pub fn configure_mqtt_options(
    endpoint: &BrokerEndpoint,
    client_id: &str,
    credentials: Option<&Credentials>,
) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(client_id, endpoint.address.trim(), endpoint.port);
    mqtt_options
        .set_keep_alive(endpoint.keep_alive)
        .set_clean_session(true);

    if endpoint.encrypted {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(
            credentials.username.clone(),
            credentials.password.clone().unwrap_or_default(),
        );
    }

    mqtt_options
}
