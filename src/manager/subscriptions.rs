//! Topic subscription management
//!
//! Subscriptions are requested in one batch right after the handshake and
//! released in one batch before a controlled close. The set actually requested
//! is recorded so the manager can report and undo exactly that set.

use crate::config::{ConnectionSettings, DeliveryGuarantee};
use crate::transport::{TransportClient, TransportError};
use tracing::{debug, info};

/// A single topic filter with the QoS it is requested at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub qos: DeliveryGuarantee,
}

impl SubscriptionRequest {
    pub fn new(topic: impl Into<String>, qos: DeliveryGuarantee) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Topics currently subscribed on the live connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    topics: Vec<String>,
}

impl SubscriptionSet {
    pub fn new(topics: Vec<String>) -> Self {
        Self { topics }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

pub struct TopicSubscriptionManager;

impl TopicSubscriptionManager {
    /// One request per configured topic, all at the configured QoS (pure function)
    pub fn build_requests(settings: &ConnectionSettings) -> Vec<SubscriptionRequest> {
        settings
            .topics
            .iter()
            .map(|topic| SubscriptionRequest::new(topic.clone(), settings.qos))
            .collect()
    }

    /// Request every configured topic in a single transport call
    ///
    /// With no topics configured no transport call is made.
    pub fn subscribe_all<T: TransportClient + ?Sized>(
        client: &T,
        settings: &ConnectionSettings,
    ) -> Result<SubscriptionSet, TransportError> {
        let requests = Self::build_requests(settings);
        if requests.is_empty() {
            debug!("No topics configured; skipping subscribe");
            return Ok(SubscriptionSet::default());
        }

        client.subscribe(&requests)?;
        info!(
            "Subscribed to {} topic(s) at QoS {}",
            requests.len(),
            settings.qos.level()
        );
        Ok(SubscriptionSet::new(
            requests.into_iter().map(|request| request.topic).collect(),
        ))
    }

    /// Release the given set in a single transport call
    pub fn unsubscribe_all<T: TransportClient + ?Sized>(
        client: &T,
        subscriptions: &SubscriptionSet,
    ) -> Result<(), TransportError> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        client.unsubscribe(subscriptions.topics())?;
        debug!("Unsubscribed from {} topic(s)", subscriptions.len());
        Ok(())
    }
}
