//! Broker connection management
//!
//! [`ConnectionManager`] owns one broker connection and is driven entirely from
//! the consumer context: `connect`, `disconnect`, `publish` and `shutdown`
//! return immediately, and `tick` applies the results of background sequences,
//! dispatches inbound messages and reports connection loss. Observer callbacks
//! fire only from those calls.
//!
//! ```rust,no_run
//! use broker_link::config::ConnectionSettings;
//! use broker_link::manager::{ConnectionManager, EventForwarder};
//! use broker_link::transport::mqtt::RumqttcConnector;
//!
//! # async fn run() -> Result<(), broker_link::error::ManagerError> {
//! let mut settings = ConnectionSettings::new("localhost", 1883);
//! settings.topics = vec!["sensor/a".to_string()];
//!
//! let mut manager = ConnectionManager::new(settings, RumqttcConnector::new())?;
//! let (forwarder, mut events) = EventForwarder::channel();
//! manager.add_observer(Box::new(forwarder));
//! manager.connect();
//!
//! let mut ticker = tokio::time::interval(std::time::Duration::from_millis(16));
//! loop {
//!     ticker.tick().await;
//!     manager.tick();
//!     while let Ok(event) = events.try_recv() {
//!         println!("{event:?}");
//!     }
//! }
//! # }
//! ```

pub mod buffer;
pub mod dispatcher;
pub mod lifecycle;
pub mod observer;
pub mod state;
pub mod subscriptions;

pub use buffer::{InboundMessageBuffer, InboundSink, LinkMonitor, QueuedMessage};
pub use dispatcher::{
    DispatchReport, Dispatcher, PayloadDecoder, StrictUtf8Decoder, Utf8Decoder,
    DEFAULT_DRAIN_PASSES,
};
pub use lifecycle::{ConnectAttempt, DisconnectSequence, LifecycleOutcome, TaskReport};
pub use observer::{ConnectionObserver, EventForwarder, LinkEvent};
pub use state::{ConnectionState, LifecycleEvent};
pub use subscriptions::{SubscriptionRequest, SubscriptionSet, TopicSubscriptionManager};

use crate::config::{ConnectionSettings, RuntimeSection};
use crate::error::{ManagerError, ManagerResult};
use crate::link_span;
use crate::transport::mqtt::RumqttcConnector;
use crate::transport::{TransportClient, TransportConnector};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Counters describing the link since the manager was created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStats {
    pub messages_received: u64,
    pub messages_published: u64,
    pub publishes_skipped: u64,
    pub decode_failures: u64,
    pub connect_attempts: u64,
    pub connection_losses: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What one call to [`ConnectionManager::tick`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Background outcomes applied to the state machine
    pub outcomes_applied: usize,
    /// Messages delivered to observers
    pub messages_dispatched: usize,
    /// An unsolicited loss was reported this tick
    pub connection_lost: bool,
}

struct InFlight {
    epoch: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Manages a single broker connection on behalf of the consumer loop
pub struct ConnectionManager<C: TransportConnector = RumqttcConnector> {
    settings: ConnectionSettings,
    connector: Arc<C>,
    runtime: Handle,
    state: ConnectionState,
    client: Option<C::Client>,
    subscriptions: SubscriptionSet,
    buffer: Arc<InboundMessageBuffer>,
    link: Arc<LinkMonitor>,
    dispatcher: Dispatcher,
    observers: Vec<Box<dyn ConnectionObserver>>,
    outcomes_tx: mpsc::UnboundedSender<TaskReport<C::Client>>,
    outcomes_rx: mpsc::UnboundedReceiver<TaskReport<C::Client>>,
    in_flight: Option<InFlight>,
    epoch: u64,
    stats: LinkStats,
}

impl<C: TransportConnector> ConnectionManager<C> {
    /// Create a manager that spawns its background work on the current tokio runtime
    pub fn new(settings: ConnectionSettings, connector: C) -> ManagerResult<Self> {
        let runtime = Handle::try_current().map_err(|e| ManagerError::RuntimeUnavailable {
            detail: e.to_string(),
        })?;
        Self::with_runtime(settings, connector, runtime)
    }

    pub fn with_runtime(
        mut settings: ConnectionSettings,
        connector: C,
        runtime: Handle,
    ) -> ManagerResult<Self> {
        settings.apply_broker_url()?;
        settings.validate()?;
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        Ok(Self {
            settings,
            connector: Arc::new(connector),
            runtime,
            state: ConnectionState::Idle,
            client: None,
            subscriptions: SubscriptionSet::default(),
            buffer: Arc::new(InboundMessageBuffer::new()),
            link: Arc::new(LinkMonitor::new()),
            dispatcher: Dispatcher::default(),
            observers: Vec::new(),
            outcomes_tx,
            outcomes_rx,
            in_flight: None,
            epoch: 0,
            stats: LinkStats::default(),
        })
    }

    /// Apply the `[runtime]` section of the configuration file
    pub fn with_runtime_section(mut self, runtime: &RuntimeSection) -> Self {
        self.dispatcher = std::mem::take(&mut self.dispatcher).with_drain_passes(runtime.drain_passes);
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn PayloadDecoder>) -> Self {
        self.dispatcher.set_decoder(decoder);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn ConnectionObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Topics subscribed on the live connection
    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    /// Messages received but not yet dispatched
    pub fn pending_messages(&self) -> usize {
        self.buffer.pending()
    }

    /// QoS 1/2 publishes the broker has not finished acknowledging
    pub fn pending_publishes(&self) -> usize {
        self.client
            .as_ref()
            .map(|client| client.pending_publishes())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Connect if `auto_connect` is set. Returns true if an attempt was started.
    pub fn start(&mut self) -> bool {
        if self.settings.auto_connect {
            self.connect()
        } else {
            debug!("auto_connect disabled; waiting for an explicit connect");
            false
        }
    }

    /// Start a connect attempt. No-op unless the manager is idle, disconnected or failed.
    ///
    /// Returns true if a new attempt was started.
    pub fn connect(&mut self) -> bool {
        if !self.state.can_connect() {
            debug!("connect() ignored in state {}", self.state);
            return false;
        }
        self.apply_event(LifecycleEvent::ConnectRequested);
        self.stats.connect_attempts += 1;
        for observer in self.observers.iter_mut() {
            observer.connecting(&self.settings);
        }

        // Fresh flags per connection so a stale session's closure cannot be
        // mistaken for a loss of this one.
        self.link = Arc::new(LinkMonitor::new());
        let cancel = CancellationToken::new();
        let attempt = ConnectAttempt {
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            sink: InboundSink::new(self.buffer.clone(), self.link.clone()),
            link: self.link.clone(),
            cancel: cancel.clone(),
        };

        let epoch = self.next_epoch();
        let span = link_span!(
            epoch = epoch,
            address = %self.settings.address,
            port = self.settings.port
        );
        let outcomes_tx = self.outcomes_tx.clone();
        let handle = self.runtime.spawn(
            async move {
                let outcome = attempt.run().await;
                debug!("Connect attempt finished: {}", outcome.kind());
                let _ = outcomes_tx.send(TaskReport { epoch, outcome });
            }
            .instrument(span),
        );

        self.in_flight = Some(InFlight {
            epoch,
            cancel,
            handle,
        });
        true
    }

    /// Close the connection, or cancel the attempt in flight
    ///
    /// Returns true if a disconnect was started.
    pub fn disconnect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected => {
                self.apply_event(LifecycleEvent::DisconnectRequested);
                self.link.mark_disconnected();
                self.link.take_lost();
                let subscriptions = std::mem::take(&mut self.subscriptions);
                match self.client.take() {
                    Some(client) => self.spawn_disconnect(client, subscriptions),
                    None => self.finish_disconnect(LifecycleEvent::Closed),
                }
                true
            }
            ConnectionState::Connecting => {
                self.apply_event(LifecycleEvent::DisconnectRequested);
                if let Some(in_flight) = &self.in_flight {
                    in_flight.cancel.cancel();
                }
                true
            }
            _ => {
                debug!("disconnect() ignored in state {}", self.state);
                false
            }
        }
    }

    /// Publish UTF-8 text. Skipped with a warning unless connected.
    pub fn publish(&mut self, topic: &str, text: &str) -> bool {
        self.publish_bytes(topic, text.as_bytes().to_vec())
    }

    /// Publish a number as 4 little-endian bytes. Skipped with a warning unless connected.
    pub fn publish_f32(&mut self, topic: &str, value: f32) -> bool {
        self.publish_bytes(topic, value.to_le_bytes().to_vec())
    }

    /// Publish raw bytes at the configured QoS without retain
    ///
    /// Returns true if the request was handed to the transport.
    pub fn publish_bytes(&mut self, topic: &str, payload: Vec<u8>) -> bool {
        let client = match &self.client {
            Some(client) if self.state.can_publish() && client.is_connected() => client,
            _ => {
                warn!("{}", ManagerError::publish_skipped(topic));
                self.stats.publishes_skipped += 1;
                return false;
            }
        };

        match client.publish(topic, payload, self.settings.qos, false) {
            Ok(()) => {
                self.stats.messages_published += 1;
                true
            }
            Err(e) => {
                warn!("Publish to '{}' failed: {}", topic, e);
                self.stats.publishes_skipped += 1;
                false
            }
        }
    }

    /// Advance the manager: apply background outcomes, dispatch messages, report loss
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            outcomes_applied: self.collect_outcomes(),
            ..Default::default()
        };

        let dispatch = self
            .dispatcher
            .dispatch(&self.buffer, &self.link, &mut self.observers);
        if dispatch.dispatched > 0 {
            self.stats.messages_received += dispatch.dispatched as u64;
            self.stats.last_message_at = dispatch.last_received_at;
        }
        self.stats.decode_failures += dispatch.skipped as u64;
        report.messages_dispatched = dispatch.dispatched;

        if dispatch.loss_pending && self.state.is_connected() && self.link.take_lost() {
            self.handle_connection_lost();
            report.connection_lost = true;
        }

        report
    }

    /// Close everything without waiting. Safe to call in any state.
    pub fn shutdown(&mut self) {
        let previous = self.state;
        info!("Shutting down broker link from state {}", previous);

        // Invalidate whatever is in flight; late results are closed when seen.
        self.next_epoch();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
        }
        while let Ok(report) = self.outcomes_rx.try_recv() {
            self.discard_report(report);
        }

        self.link.mark_disconnected();
        self.link.take_lost();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        if let Some(client) = self.client.take() {
            lifecycle::close_client(client, &subscriptions);
        }

        self.apply_event(LifecycleEvent::Shutdown);
        let dropped = self.buffer.clear();
        if dropped > 0 {
            debug!("Dropped {} undispatched message(s)", dropped);
        }

        if matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.notify(|observer| observer.disconnected());
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn apply_event(&mut self, event: LifecycleEvent) -> bool {
        match state::transition(self.state, event) {
            Some(next) => {
                if next != self.state {
                    state::log_state_transition(self.state, next);
                }
                self.state = next;
                true
            }
            None => {
                debug!("Ignoring {:?} in state {}", event, self.state);
                false
            }
        }
    }

    fn notify(&mut self, mut callback: impl FnMut(&mut dyn ConnectionObserver)) {
        for observer in self.observers.iter_mut() {
            callback(observer.as_mut());
        }
    }

    fn spawn_disconnect(&mut self, client: C::Client, subscriptions: SubscriptionSet) {
        let epoch = self.next_epoch();
        let span = link_span!(epoch = epoch, address = %self.settings.address, port = self.settings.port);
        let sequence = DisconnectSequence {
            client,
            subscriptions,
        };
        let outcomes_tx = self.outcomes_tx.clone();
        let handle = self.runtime.spawn(
            async move {
                let outcome = sequence.run().await;
                let _ = outcomes_tx.send(TaskReport { epoch, outcome });
            }
            .instrument(span),
        );
        self.in_flight = Some(InFlight {
            epoch,
            cancel: CancellationToken::new(),
            handle,
        });
    }

    fn finish_disconnect(&mut self, event: LifecycleEvent) {
        if self.apply_event(event) {
            self.notify(|observer| observer.disconnected());
        }
    }

    /// Apply every report waiting in the channel. Returns the number applied.
    fn collect_outcomes(&mut self) -> usize {
        // Checked before draining: a task that finished has already sent its report.
        let finished = self
            .in_flight
            .as_ref()
            .filter(|in_flight| in_flight.handle.is_finished())
            .map(|in_flight| in_flight.epoch);

        let mut applied = 0;
        while let Ok(report) = self.outcomes_rx.try_recv() {
            if self.apply_report(report) {
                applied += 1;
            }
        }

        if let Some(epoch) = finished {
            if self.in_flight.as_ref().is_some_and(|f| f.epoch == epoch) {
                self.in_flight = None;
                self.handle_task_aborted();
                applied += 1;
            }
        }
        applied
    }

    fn apply_report(&mut self, report: TaskReport<C::Client>) -> bool {
        if !self.in_flight.as_ref().is_some_and(|f| f.epoch == report.epoch) {
            self.discard_report(report);
            return false;
        }
        self.in_flight = None;

        match report.outcome {
            LifecycleOutcome::Connected {
                client,
                subscriptions,
            } => match self.state {
                ConnectionState::Connecting => {
                    self.client = Some(client);
                    self.subscriptions = subscriptions;
                    self.apply_event(LifecycleEvent::Established);
                    self.notify(|observer| observer.connection_succeeded());
                }
                _ => {
                    // Disconnect was requested after the handshake completed
                    self.link.mark_disconnected();
                    self.link.take_lost();
                    self.spawn_disconnect(client, subscriptions);
                }
            },
            LifecycleOutcome::ConnectFailed(error) => {
                if self.state == ConnectionState::Disconnecting {
                    self.finish_disconnect(LifecycleEvent::AttemptCancelled);
                } else {
                    self.fail_attempt(error);
                }
            }
            LifecycleOutcome::ConnectCancelled => {
                self.finish_disconnect(LifecycleEvent::AttemptCancelled);
            }
            LifecycleOutcome::Closed => self.finish_disconnect(LifecycleEvent::Closed),
        }
        true
    }

    fn discard_report(&mut self, report: TaskReport<C::Client>) {
        debug!(
            "Discarding stale {} outcome from epoch {}",
            report.outcome.kind(),
            report.epoch
        );
        if let LifecycleOutcome::Connected {
            client,
            subscriptions,
        } = report.outcome
        {
            lifecycle::close_client(client, &subscriptions);
        }
    }

    fn fail_attempt(&mut self, error: ManagerError) {
        warn!("{}", error);
        self.stats.last_error = Some(error.to_string());
        if self.apply_event(LifecycleEvent::AttemptFailed) {
            self.notify(|observer| observer.connection_failed(&error));
        }
    }

    fn handle_task_aborted(&mut self) {
        let error = ManagerError::task_aborted(format!("task ended while {}", self.state));
        match self.state {
            ConnectionState::Connecting => self.fail_attempt(error),
            ConnectionState::Disconnecting => {
                warn!("{}", error);
                self.stats.last_error = Some(error.to_string());
                self.finish_disconnect(LifecycleEvent::AttemptCancelled);
            }
            _ => debug!("{}", error),
        }
    }

    fn handle_connection_lost(&mut self) {
        let error = ManagerError::connection_lost("broker closed the connection");
        self.stats.connection_losses += 1;
        self.stats.last_error = Some(error.to_string());

        // The session is gone; drop it without unsubscribing.
        self.client = None;
        self.subscriptions = SubscriptionSet::default();
        if self.apply_event(LifecycleEvent::ConnectionLost) {
            self.notify(|observer| observer.connection_lost());
        }
    }
}

impl ConnectionManager<RumqttcConnector> {
    /// Manager backed by the default rumqttc transport
    pub fn with_rumqttc(settings: ConnectionSettings) -> ManagerResult<Self> {
        Self::new(settings, RumqttcConnector::new())
    }
}

impl<C: TransportConnector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        // Quiet close: no observer notifications from drop.
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
        }
        self.link.mark_disconnected();
        if let Some(mut client) = self.client.take() {
            let _ = client.disconnect();
        }
    }
}
