//! Double-buffered inbound message queue
//!
//! The network task appends to the *front* slot; the consumer flips which slot
//! is front and takes the previous front's contents. The mutex is held only for
//! the append or for the index flip plus a `Vec` swap, so decoding and observer
//! callbacks never run under the lock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// A message received from the broker, waiting to be dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    topic: String,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

#[derive(Debug, Default)]
struct Slots {
    slots: [Vec<QueuedMessage>; 2],
    front: usize,
}

/// Two-slot queue shared between the network task (writer) and the consumer (swapper)
#[derive(Debug, Default)]
pub struct InboundMessageBuffer {
    inner: Mutex<Slots>,
}

impl InboundMessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the slots half-written:
        // every critical section is a single push, flip or swap.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message to the current front slot
    pub fn enqueue(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.push(QueuedMessage::new(topic, payload));
    }

    pub fn push(&self, message: QueuedMessage) {
        let mut guard = self.lock();
        let front = guard.front;
        guard.slots[front].push(message);
    }

    /// Flip the front slot and move the previous front's messages into `out`.
    ///
    /// When `out` is empty its allocation is handed to the slot so the two
    /// buffers keep their capacity across ticks. A non-empty `out` keeps its
    /// contents and receives the drained messages after them.
    pub fn swap_into(&self, out: &mut Vec<QueuedMessage>) {
        let mut guard = self.lock();
        let back = guard.front;
        guard.front = 1 - back;
        if out.is_empty() {
            std::mem::swap(&mut guard.slots[back], out);
        } else {
            out.append(&mut guard.slots[back]);
        }
    }

    /// Flip the front slot and return everything enqueued before the flip
    pub fn swap_and_drain(&self) -> Vec<QueuedMessage> {
        let mut drained = Vec::new();
        self.swap_into(&mut drained);
        drained
    }

    /// Number of messages waiting in the front slot
    pub fn pending(&self) -> usize {
        let guard = self.lock();
        guard.slots[guard.front].len()
    }

    /// Drop every queued message in both slots
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let dropped = guard.slots.iter().map(Vec::len).sum();
        for slot in guard.slots.iter_mut() {
            slot.clear();
        }
        dropped
    }
}

/// Connection flags shared with the network task
///
/// `connected` is raised when the handshake is issued and lowered when the
/// attempt fails or before any controlled close; a closure reported while it
/// is raised becomes a pending loss for the next tick.
#[derive(Debug, Default)]
pub struct LinkMonitor {
    connected: AtomicBool,
    lost: AtomicBool,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self) {
        self.lost.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Lower the connected flag ahead of a controlled close
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a transport closure. Returns true if it counts as an unsolicited loss.
    pub fn connection_closed(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if was_connected {
            self.lost.store(true, Ordering::Release);
        }
        was_connected
    }

    /// Consume the pending loss flag
    pub fn take_lost(&self) -> bool {
        self.lost.swap(false, Ordering::AcqRel)
    }

    pub fn is_lost_pending(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// Handle given to a transport so it can report inbound traffic
///
/// Cheap to clone; all methods are safe to call from any thread and never block
/// beyond the buffer's short critical section.
#[derive(Debug, Clone)]
pub struct InboundSink {
    buffer: Arc<InboundMessageBuffer>,
    link: Arc<LinkMonitor>,
}

impl InboundSink {
    pub fn new(buffer: Arc<InboundMessageBuffer>, link: Arc<LinkMonitor>) -> Self {
        Self { buffer, link }
    }

    pub fn message_received(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.buffer.enqueue(topic, payload);
    }

    pub fn connection_closed(&self) {
        if self.link.connection_closed() {
            warn!("Broker connection closed unexpectedly; loss will be reported on next tick");
        } else {
            debug!("Broker connection closed");
        }
    }
}
