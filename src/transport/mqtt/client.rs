//! rumqttc-backed transport client
//!
//! Construction only validates the endpoint. `connect` builds the rumqttc
//! client, spawns the network task that polls its event loop, and resolves
//! once CONNACK arrives or the handshake fails. The network task writes
//! inbound messages and closures to the [`InboundSink`]; everything else on
//! the client just queues requests for it.

use super::connection::{
    configure_mqtt_options, qos_for, validate_client_id, validate_endpoint, SessionState,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{Credentials, DeliveryGuarantee};
use crate::manager::subscriptions::SubscriptionRequest;
use crate::transport::{
    BrokerEndpoint, InboundSink, TransportClient, TransportConnector, TransportError,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, SubscribeFilter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the rumqttc request channel
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// Upper bound on flushing DISCONNECT during a controlled close
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Builds [`RumqttcClient`]s
#[derive(Debug, Clone)]
pub struct RumqttcConnector {
    request_capacity: usize,
}

impl RumqttcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_capacity(request_capacity: usize) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
        }
    }
}

impl Default for RumqttcConnector {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl TransportConnector for RumqttcConnector {
    type Client = RumqttcClient;

    fn construct(
        &self,
        endpoint: &BrokerEndpoint,
        sink: InboundSink,
    ) -> Result<Self::Client, TransportError> {
        validate_endpoint(endpoint)?;
        debug!(
            "Prepared transport for {}:{} (tls: {})",
            endpoint.address, endpoint.port, endpoint.encrypted
        );
        Ok(RumqttcClient {
            endpoint: endpoint.clone(),
            sink,
            request_capacity: self.request_capacity,
            session: None,
        })
    }
}

struct Session {
    client: AsyncClient,
    state_rx: watch::Receiver<SessionState>,
    closing: Arc<AtomicBool>,
    unacked: Arc<AtomicUsize>,
    cancel: CancellationToken,
    _event_loop: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stops the network task; a controlled close flushes DISCONNECT first.
        self.cancel.cancel();
    }
}

/// A single broker session driven by rumqttc
pub struct RumqttcClient {
    endpoint: BrokerEndpoint,
    sink: InboundSink,
    request_capacity: usize,
    session: Option<Session>,
}

impl RumqttcClient {
    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or(TransportError::NotConnected)
    }

    /// Wait for the network task to report the handshake result
    async fn wait_for_connack(
        mut state_rx: watch::Receiver<SessionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    SessionState::Open => return Ok(()),
                    SessionState::Closed(reason) => return Err(TransportError::Handshake(reason)),
                    SessionState::Handshaking => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::Closed(
                        "network task stopped".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<SessionState>,
        sink: InboundSink,
        cancel: CancellationToken,
        closing: Arc<AtomicBool>,
        unacked: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if closing.load(Ordering::Acquire) {
                        Self::flush_disconnect(&mut event_loop).await;
                    }
                    break;
                }
                polled = event_loop.poll() => {
                    let route = match polled {
                        Ok(event) => MessageHandler::route_event(&event),
                        Err(e) => EventRoute::Closed(e.to_string()),
                    };
                    if !Self::process_event_route(route, &state_tx, &sink, &unacked) {
                        break;
                    }
                }
            }
        }
        debug!("Network task stopped");
    }

    /// Act on one routing decision. Returns false when the session is over.
    fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<SessionState>,
        sink: &InboundSink,
        unacked: &AtomicUsize,
    ) -> bool {
        match route {
            EventRoute::Acknowledged => {
                info!("CONNACK received");
                state_tx.send_replace(SessionState::Open);
            }
            EventRoute::MessageReceived { topic, payload } => {
                trace!("Inbound message on {} ({} bytes)", topic, payload.len());
                sink.message_received(topic, payload);
            }
            EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                if rejected > 0 {
                    warn!(
                        "Broker rejected {} topic filter(s) in SUBACK {}",
                        rejected, packet_id
                    );
                } else {
                    debug!("Subscription {} confirmed", packet_id);
                }
            }
            EventRoute::PublishCompleted { packet_id } => {
                trace!("Publish {} acknowledged", packet_id);
                let _ = unacked.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    count.checked_sub(1)
                });
            }
            EventRoute::DisconnectSent => {
                state_tx.send_replace(SessionState::Closed("client disconnected".to_string()));
                sink.connection_closed();
                return false;
            }
            EventRoute::Closed(reason) => {
                let was_open = matches!(*state_tx.borrow(), SessionState::Open);
                debug!("Session closed: {}", reason);
                state_tx.send_replace(SessionState::Closed(reason));
                if was_open {
                    sink.connection_closed();
                }
                return false;
            }
            EventRoute::Infrastructure(detail) => trace!("Protocol event: {}", detail),
            EventRoute::Outgoing => {}
        }
        true
    }

    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
        }
    }
}

#[async_trait]
impl TransportClient for RumqttcClient {
    async fn connect(
        &mut self,
        client_id: &str,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        validate_client_id(client_id)?;
        self.session = None;

        let options = configure_mqtt_options(&self.endpoint, client_id, credentials);
        let (client, event_loop) = AsyncClient::new(options, self.request_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Handshaking);
        let cancel = CancellationToken::new();
        let closing = Arc::new(AtomicBool::new(false));
        let unacked = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            state_tx,
            self.sink.clone(),
            cancel.clone(),
            closing.clone(),
            unacked.clone(),
        ));

        self.session = Some(Session {
            client,
            state_rx: state_rx.clone(),
            closing,
            unacked,
            cancel,
            _event_loop: handle,
        });

        let result = Self::wait_for_connack(state_rx, timeout).await;
        if result.is_err() {
            self.session = None;
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| matches!(*session.state_rx.borrow(), SessionState::Open))
            .unwrap_or(false)
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryGuarantee,
        retain: bool,
    ) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .client
            .try_publish(topic, qos_for(qos), retain, payload)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if qos != DeliveryGuarantee::AtMostOnce {
            session.unacked.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn subscribe(&self, requests: &[SubscriptionRequest]) -> Result<(), TransportError> {
        if requests.is_empty() {
            return Ok(());
        }
        let filters = requests
            .iter()
            .map(|request| SubscribeFilter::new(request.topic.clone(), qos_for(request.qos)));
        self.session()?
            .client
            .try_subscribe_many(filters)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        let session = self.session()?;
        for topic in topics {
            session
                .client
                .try_unsubscribe(topic.clone())
                .map_err(|e| TransportError::Request(e.to_string()))?;
        }
        Ok(())
    }

    fn pending_publishes(&self) -> usize {
        self.session
            .as_ref()
            .map(|session| session.unacked.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.closing.store(true, Ordering::Release);
        session
            .client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}
