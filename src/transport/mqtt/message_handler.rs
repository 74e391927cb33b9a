//! Pure routing of rumqttc events
//!
//! The network task turns every polled event into an [`EventRoute`] and acts on
//! that decision; nothing here touches the network.

use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use tracing::debug;

/// Pure routing decisions for polled events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a rumqttc event (pure routing decision)
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    EventRoute::Acknowledged
                }
                Packet::ConnAck(ack) => {
                    EventRoute::Closed(format!("broker refused connection: {:?}", ack.code))
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: Self::count_rejected(&suback.return_codes),
                },
                Packet::PubAck(ack) => EventRoute::PublishCompleted { packet_id: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishCompleted {
                    packet_id: comp.pkid,
                },
                Packet::Disconnect => EventRoute::Closed("broker sent DISCONNECT".to_string()),
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::Outgoing,
        }
    }

    /// Number of topic filters the broker refused in a SUBACK
    pub fn count_rejected(return_codes: &[SubscribeReasonCode]) -> usize {
        let rejected = return_codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count();
        if rejected > 0 {
            debug!("SUBACK rejected {} of {} filters", rejected, return_codes.len());
        }
        rejected
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// CONNACK accepted
    Acknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// SUBACK with the number of refused filters
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    /// Final acknowledgement of a QoS 1 (PUBACK) or QoS 2 (PUBCOMP) publish
    PublishCompleted { packet_id: u16 },
    /// Our DISCONNECT went out on the wire
    DisconnectSent,
    /// The session ended, with the reason
    Closed(String),
    /// Pings, acknowledgements and other protocol traffic
    Infrastructure(String),
    Outgoing,
}
