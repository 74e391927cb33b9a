//! Per-tick message dispatch
//!
//! The dispatcher swaps the inbound buffer a fixed number of times per tick
//! (two by default, so messages that arrive while the first batch is being
//! delivered still go out on the same tick) and hands each decoded payload to
//! every observer in arrival order.

use super::buffer::{InboundMessageBuffer, LinkMonitor, QueuedMessage};
use super::observer::ConnectionObserver;
use crate::dispatch_span;
use chrono::{DateTime, Utc};
use tracing::{trace, warn};

/// Swap-and-drain passes per tick
pub const DEFAULT_DRAIN_PASSES: usize = 2;

/// Turns a raw payload into the text handed to observers
///
/// Returning `None` skips the message with a warning.
pub trait PayloadDecoder: Send {
    fn decode(&self, topic: &str, payload: &[u8]) -> Option<String>;
}

impl<F> PayloadDecoder for F
where
    F: Fn(&str, &[u8]) -> Option<String> + Send,
{
    fn decode(&self, topic: &str, payload: &[u8]) -> Option<String> {
        self(topic, payload)
    }
}

/// UTF-8 decoding; invalid sequences become U+FFFD
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl PayloadDecoder for Utf8Decoder {
    fn decode(&self, _topic: &str, payload: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(payload).into_owned())
    }
}

/// UTF-8 decoding that skips payloads which are not valid UTF-8
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictUtf8Decoder;

impl PayloadDecoder for StrictUtf8Decoder {
    fn decode(&self, _topic: &str, payload: &[u8]) -> Option<String> {
        std::str::from_utf8(payload).ok().map(str::to_owned)
    }
}

/// Result of one dispatch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages delivered to observers
    pub dispatched: usize,
    /// Messages the decoder rejected
    pub skipped: usize,
    /// The network task recorded an unsolicited closure that has not been reported yet
    pub loss_pending: bool,
    /// Arrival time of the newest message drained this run
    pub last_received_at: Option<DateTime<Utc>>,
}

pub struct Dispatcher {
    decoder: Box<dyn PayloadDecoder>,
    drain_passes: usize,
    scratch: Vec<QueuedMessage>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Box::new(Utf8Decoder))
    }
}

impl Dispatcher {
    pub fn new(decoder: Box<dyn PayloadDecoder>) -> Self {
        Self {
            decoder,
            drain_passes: DEFAULT_DRAIN_PASSES,
            scratch: Vec::new(),
        }
    }

    /// Set the number of swap-and-drain passes per tick (at least one)
    pub fn with_drain_passes(mut self, drain_passes: usize) -> Self {
        self.drain_passes = drain_passes.max(1);
        self
    }

    pub fn set_decoder(&mut self, decoder: Box<dyn PayloadDecoder>) {
        self.decoder = decoder;
    }

    pub fn drain_passes(&self) -> usize {
        self.drain_passes
    }

    /// Deliver everything queued in `buffer` to `observers`
    pub fn dispatch(
        &mut self,
        buffer: &InboundMessageBuffer,
        link: &LinkMonitor,
        observers: &mut [Box<dyn ConnectionObserver>],
    ) -> DispatchReport {
        let _span = dispatch_span!(passes = self.drain_passes).entered();
        let mut report = DispatchReport::default();

        for pass in 0..self.drain_passes {
            buffer.swap_into(&mut self.scratch);
            if self.scratch.is_empty() {
                continue;
            }
            trace!("Pass {}: {} message(s)", pass, self.scratch.len());

            for message in self.scratch.drain(..) {
                report.last_received_at = Some(message.received_at());
                let Some(text) = self.decoder.decode(message.topic(), message.payload()) else {
                    warn!(
                        "Could not decode {} byte payload on {}; skipping",
                        message.payload().len(),
                        message.topic()
                    );
                    report.skipped += 1;
                    continue;
                };
                for observer in observers.iter_mut() {
                    observer.message_decoded(message.topic(), &text);
                }
                report.dispatched += 1;
            }
        }

        report.loss_pending = link.is_lost_pending();
        report
    }
}
