//! Mock implementations for testing
//!
//! Provides a mock transport and a recording observer so connection scenarios
//! can be exercised without a running broker.

use crate::config::{ConnectionSettings, Credentials, DeliveryGuarantee};
use crate::error::ManagerError;
use crate::manager::observer::{ConnectionObserver, LinkEvent};
use crate::manager::subscriptions::SubscriptionRequest;
use crate::transport::{
    BrokerEndpoint, InboundSink, TransportClient, TransportConnector, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Every call the manager made into the mock transport, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Construct {
        address: String,
        port: u16,
        encrypted: bool,
    },
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
    },
    Subscribe(Vec<SubscriptionRequest>),
    Unsubscribe(Vec<String>),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    },
    Disconnect,
}

#[derive(Debug, Clone, Default)]
struct MockBehaviour {
    construction_error: Option<String>,
    handshake_error: Option<String>,
    handshake_delay: Duration,
    report_not_connected: bool,
    close_after_handshake: bool,
    hold_acknowledgements: bool,
    subscribe_error: Option<String>,
}

#[derive(Debug, Default)]
struct MockBrokerState {
    calls: Vec<TransportCall>,
    sink: Option<InboundSink>,
    unacknowledged: usize,
}

/// Mock transport connector
///
/// Clones share the same call log, so a test keeps one clone and hands the
/// other to the manager.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockBrokerState>>,
    behaviour: MockBehaviour,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `construct` call fails
    pub fn failing_construction(mut self, reason: impl Into<String>) -> Self {
        self.behaviour.construction_error = Some(reason.into());
        self
    }

    /// Every handshake fails
    pub fn failing_handshake(mut self, reason: impl Into<String>) -> Self {
        self.behaviour.handshake_error = Some(reason.into());
        self
    }

    pub fn failing_subscribe(mut self, reason: impl Into<String>) -> Self {
        self.behaviour.subscribe_error = Some(reason.into());
        self
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.behaviour.handshake_delay = delay;
        self
    }

    /// Handshake succeeds but the client then reports not connected
    pub fn reporting_not_connected(mut self) -> Self {
        self.behaviour.report_not_connected = true;
        self
    }

    /// Broker drops the session right after CONNACK, before the attempt finishes
    pub fn closing_after_handshake(mut self) -> Self {
        self.behaviour.close_after_handshake = true;
        self
    }

    /// QoS 1/2 publishes stay pending until [`MockConnector::acknowledge_publishes`]
    pub fn holding_acknowledgements(mut self) -> Self {
        self.behaviour.hold_acknowledgements = true;
        self
    }

    /// Complete every pending publish as the broker's acknowledgements would
    pub fn acknowledge_publishes(&self) {
        self.lock().unacknowledged = 0;
    }

    fn lock(&self) -> MutexGuard<'_, MockBrokerState> {
        lock_state(&self.state)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn connect_count(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Connect { .. }))
    }

    pub fn publish_count(&self) -> usize {
        self.count_calls(|call| matches!(call, TransportCall::Publish { .. }))
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Deliver a message as the network task would. Callable from any thread.
    ///
    /// Returns false if no client has been constructed yet.
    pub fn simulate_message(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => {
                sink.message_received(topic, payload);
                true
            }
            None => false,
        }
    }

    /// Report an unsolicited closure as the network task would
    pub fn simulate_connection_closed(&self) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => {
                sink.connection_closed();
                true
            }
            None => false,
        }
    }
}

fn lock_state(state: &Mutex<MockBrokerState>) -> MutexGuard<'_, MockBrokerState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TransportConnector for MockConnector {
    type Client = MockClient;

    fn construct(
        &self,
        endpoint: &BrokerEndpoint,
        sink: InboundSink,
    ) -> Result<Self::Client, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Construct {
            address: endpoint.address.clone(),
            port: endpoint.port,
            encrypted: endpoint.encrypted,
        });
        if let Some(reason) = &self.behaviour.construction_error {
            return Err(TransportError::InvalidEndpoint(reason.clone()));
        }
        state.sink = Some(sink);

        Ok(MockClient {
            state: self.state.clone(),
            behaviour: self.behaviour.clone(),
            connected: false,
        })
    }
}

/// Mock transport client created by [`MockConnector`]
#[derive(Debug)]
pub struct MockClient {
    state: Arc<Mutex<MockBrokerState>>,
    behaviour: MockBehaviour,
    connected: bool,
}

impl MockClient {
    fn record(&self, call: TransportCall) {
        lock_state(&self.state).calls.push(call);
    }
}

#[async_trait]
impl TransportClient for MockClient {
    async fn connect(
        &mut self,
        client_id: &str,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            client_id: client_id.to_string(),
            username: credentials.map(|c| c.username.clone()),
            password: credentials.and_then(|c| c.password.clone()),
        });

        if !self.behaviour.handshake_delay.is_zero() {
            if self.behaviour.handshake_delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(timeout));
            }
            tokio::time::sleep(self.behaviour.handshake_delay).await;
        }

        if let Some(reason) = &self.behaviour.handshake_error {
            return Err(TransportError::Handshake(reason.clone()));
        }
        self.connected = !self.behaviour.report_not_connected;
        if self.behaviour.close_after_handshake {
            let sink = lock_state(&self.state).sink.clone();
            if let Some(sink) = sink {
                sink.connection_closed();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut state = lock_state(&self.state);
        state.calls.push(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        if self.behaviour.hold_acknowledgements && qos != DeliveryGuarantee::AtMostOnce {
            state.unacknowledged += 1;
        }
        Ok(())
    }

    fn subscribe(&self, requests: &[SubscriptionRequest]) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe(requests.to_vec()));
        match &self.behaviour.subscribe_error {
            Some(reason) => Err(TransportError::Request(reason.clone())),
            None => Ok(()),
        }
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe(topics.to_vec()));
        Ok(())
    }

    fn pending_publishes(&self) -> usize {
        lock_state(&self.state).unacknowledged
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        self.connected = false;
        Ok(())
    }
}

/// Observer that records every notification it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<LinkEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LinkEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.lock().clone()
    }

    /// Number of events with the given callback name, e.g. `"connection_lost"`
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|event| event.name() == name).count()
    }

    /// Decoded messages in delivery order
    pub fn messages(&self) -> Vec<(String, String)> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                LinkEvent::MessageDecoded { topic, text } => Some((topic.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, event: LinkEvent) {
        self.lock().push(event);
    }
}

impl ConnectionObserver for RecordingObserver {
    fn connecting(&mut self, settings: &ConnectionSettings) {
        self.push(LinkEvent::Connecting {
            address: settings.address.clone(),
            port: settings.port,
        });
    }

    fn connection_succeeded(&mut self) {
        self.push(LinkEvent::ConnectionSucceeded);
    }

    fn connection_failed(&mut self, error: &ManagerError) {
        self.push(LinkEvent::ConnectionFailed(error.to_string()));
    }

    fn disconnected(&mut self) {
        self.push(LinkEvent::Disconnected);
    }

    fn connection_lost(&mut self) {
        self.push(LinkEvent::ConnectionLost);
    }

    fn message_decoded(&mut self, topic: &str, text: &str) {
        self.push(LinkEvent::MessageDecoded {
            topic: topic.to_string(),
            text: text.to_string(),
        });
    }
}
