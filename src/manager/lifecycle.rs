//! Background connect and disconnect sequences
//!
//! Each sequence runs as a tokio task and reports a single
//! [`LifecycleOutcome`] back to the manager, which applies it on the next
//! tick. Connect attempts observe a cancellation token at every await point.

use super::buffer::LinkMonitor;
use super::subscriptions::{SubscriptionSet, TopicSubscriptionManager};
use crate::config::ConnectionSettings;
use crate::error::ManagerError;
use crate::transport::{BrokerEndpoint, InboundSink, TransportClient, TransportConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a background sequence produced
pub enum LifecycleOutcome<T> {
    /// Handshake succeeded and the configured topics were requested
    Connected {
        client: T,
        subscriptions: SubscriptionSet,
    },
    ConnectFailed(ManagerError),
    /// The attempt stopped at a cancellation point
    ConnectCancelled,
    /// A disconnect sequence closed the transport
    Closed,
}

impl<T> LifecycleOutcome<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleOutcome::Connected { .. } => "connected",
            LifecycleOutcome::ConnectFailed(_) => "connect_failed",
            LifecycleOutcome::ConnectCancelled => "connect_cancelled",
            LifecycleOutcome::Closed => "closed",
        }
    }
}

/// Outcome tagged with the epoch of the task that produced it
pub struct TaskReport<T> {
    pub epoch: u64,
    pub outcome: LifecycleOutcome<T>,
}

/// Sleep for `delay` unless `cancel` fires first. Returns false if cancelled.
pub async fn interruptible_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// One connect attempt: delay, construct, settle, handshake, subscribe
pub struct ConnectAttempt<C: TransportConnector> {
    pub settings: ConnectionSettings,
    pub connector: Arc<C>,
    pub sink: InboundSink,
    pub link: Arc<LinkMonitor>,
    pub cancel: CancellationToken,
}

impl<C: TransportConnector> ConnectAttempt<C> {
    pub async fn run(self) -> LifecycleOutcome<C::Client> {
        let ConnectAttempt {
            settings,
            connector,
            sink,
            link,
            cancel,
        } = self;

        if !interruptible_sleep(&cancel, settings.connect_delay()).await {
            debug!("Connect attempt cancelled before start");
            return LifecycleOutcome::ConnectCancelled;
        }

        let endpoint = BrokerEndpoint::from_settings(&settings);
        let mut client = match connector.construct(&endpoint, sink) {
            Ok(client) => client,
            Err(e) => {
                return LifecycleOutcome::ConnectFailed(
                    ManagerError::transport_construction_failed(e.to_string()),
                );
            }
        };

        if !interruptible_sleep(&cancel, settings.settle_delay()).await {
            debug!("Connect attempt cancelled before handshake");
            return LifecycleOutcome::ConnectCancelled;
        }

        let client_id = Uuid::new_v4().to_string();
        let credentials = settings.credentials();
        info!(
            "Connecting to {}:{} as {}",
            endpoint.address, endpoint.port, client_id
        );

        // Raised before the handshake so a closure reported as soon as the
        // session opens is recorded as a loss.
        link.mark_connected();

        let handshake = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Connect attempt cancelled during handshake");
                abandon_link(&link);
                return LifecycleOutcome::ConnectCancelled;
            }
            result = client.connect(&client_id, credentials.as_ref(), settings.connect_timeout()) => result,
        };
        if let Err(e) = handshake {
            abandon_link(&link);
            return LifecycleOutcome::ConnectFailed(ManagerError::handshake_failed(e.to_string()));
        }
        if !client.is_connected() {
            abandon_link(&link);
            return LifecycleOutcome::ConnectFailed(ManagerError::handshake_failed(
                "transport reported not connected after handshake",
            ));
        }

        let subscriptions = match TopicSubscriptionManager::subscribe_all(&client, &settings) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!("Subscribing to configured topics failed: {}", e);
                SubscriptionSet::default()
            }
        };

        LifecycleOutcome::Connected {
            client,
            subscriptions,
        }
    }
}

fn abandon_link(link: &LinkMonitor) {
    link.mark_disconnected();
    link.take_lost();
}

/// Controlled close: unsubscribe, then close the transport
///
/// Failures are logged and otherwise ignored; the sequence always reports
/// [`LifecycleOutcome::Closed`].
pub struct DisconnectSequence<T> {
    pub client: T,
    pub subscriptions: SubscriptionSet,
}

impl<T: TransportClient> DisconnectSequence<T> {
    pub async fn run(self) -> LifecycleOutcome<T> {
        close_client(self.client, &self.subscriptions);
        LifecycleOutcome::Closed
    }
}

/// Unsubscribe from `subscriptions` and close `client`, logging failures
pub fn close_client<T: TransportClient>(mut client: T, subscriptions: &SubscriptionSet) {
    if let Err(e) = TopicSubscriptionManager::unsubscribe_all(&client, subscriptions) {
        warn!("Unsubscribe during disconnect failed: {}", e);
    }
    if let Err(e) = client.disconnect() {
        warn!("Closing transport failed: {}", e);
    }
}
