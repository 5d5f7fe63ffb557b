//! Subscriber sinks and the per-channel notifier slots.
//!
//! Each channel (ranging, monitoring, authorization) holds at most one sink.
//! Subscribing replaces the previous sink; cancelling empties the slot, and
//! anything delivered to an empty slot is dropped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BeaconError;
use crate::platform::PermissionStatus;
use crate::types::{MonitoringEvent, RangingEvent};

/// Receiver of one channel's events.
pub trait EventSink<E>: Send + Sync {
    /// Deliver one event.
    fn push(&self, event: E);

    /// Deliver an error. `kind` is a stable code such as `INVALID_REGION`.
    fn push_error(&self, kind: &str, message: &str);
}

/// Error as received through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    /// Stable error code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Item carried by a [`ChannelSink`].
pub type SinkItem<E> = Result<E, SinkError>;

/// Sink backed by an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelSink<E> {
    tx: mpsc::UnboundedSender<SinkItem<E>>,
}

impl<E> Clone for ChannelSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> ChannelSink<E> {
    /// Create a sink and the receiver its events arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkItem<E>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<E: Send> EventSink<E> for ChannelSink<E> {
    fn push(&self, event: E) {
        if self.tx.send(Ok(event)).is_err() {
            debug!("Sink receiver dropped, event discarded");
        }
    }

    fn push_error(&self, kind: &str, message: &str) {
        let item = Err(SinkError {
            kind: kind.to_string(),
            message: message.to_string(),
        });
        if self.tx.send(item).is_err() {
            debug!("Sink receiver dropped, error discarded");
        }
    }
}

/// Shared handle to a channel sink.
pub type SharedSink<E> = Arc<dyn EventSink<E>>;

/// Zero-or-one subscriber for one channel.
pub struct NotifierSlot<E> {
    channel: &'static str,
    sink: Option<SharedSink<E>>,
}

impl<E> fmt::Debug for NotifierSlot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierSlot")
            .field("channel", &self.channel)
            .field("subscribed", &self.sink.is_some())
            .finish()
    }
}

impl<E> NotifierSlot<E> {
    /// Empty slot for `channel`.
    #[must_use]
    pub const fn new(channel: &'static str) -> Self {
        Self {
            channel,
            sink: None,
        }
    }

    /// Replace the current subscriber.
    pub fn subscribe(&mut self, sink: SharedSink<E>) {
        if self.sink.replace(sink).is_some() {
            debug!(channel = self.channel, "Replaced existing subscriber");
        }
    }

    /// Drop the current subscriber. Returns whether one was present.
    pub fn cancel(&mut self) -> bool {
        self.sink.take().is_some()
    }

    /// Whether a subscriber is present.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.sink.is_some()
    }

    /// Push `event` to the subscriber. Returns `false` if the slot was empty.
    pub fn deliver(&self, event: E) -> bool {
        self.sink.as_ref().map_or_else(
            || {
                debug!(channel = self.channel, "No subscriber, event dropped");
                false
            },
            |sink| {
                sink.push(event);
                true
            },
        )
    }

    /// Push `error` to the subscriber, if any.
    pub fn deliver_error(&self, error: &BeaconError) -> bool {
        self.sink.as_ref().is_some_and(|sink| {
            sink.push_error(error.error_code(), &error.to_string());
            true
        })
    }
}

/// The engine's three notifier slots.
#[derive(Debug)]
pub struct Notifiers {
    /// Ranging snapshots.
    pub ranging: NotifierSlot<RangingEvent>,
    /// Monitoring transitions.
    pub monitoring: NotifierSlot<MonitoringEvent>,
    /// Authorization status changes.
    pub authorization: NotifierSlot<PermissionStatus>,
}

impl Default for Notifiers {
    fn default() -> Self {
        Self {
            ranging: NotifierSlot::new("ranging"),
            monitoring: NotifierSlot::new("monitoring"),
            authorization: NotifierSlot::new("authorization"),
        }
    }
}

impl Notifiers {
    /// Empty every slot.
    pub fn clear(&mut self) {
        self.ranging.cancel();
        self.monitoring.cancel();
        self.authorization.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_drops_events() {
        let slot = NotifierSlot::<u32>::new("test");
        assert!(!slot.deliver(1));
        assert!(!slot.deliver_error(&BeaconError::PermissionDenied));
    }

    #[test]
    fn test_subscribe_replaces_previous_sink() {
        let mut slot = NotifierSlot::<u32>::new("test");
        let (first, mut first_rx) = ChannelSink::<u32>::channel();
        let (second, mut second_rx) = ChannelSink::<u32>::channel();

        slot.subscribe(Arc::new(first));
        slot.subscribe(Arc::new(second));
        assert!(slot.deliver(7));

        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap(), Ok(7));
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let mut slot = NotifierSlot::<u32>::new("test");
        let (sink, mut rx) = ChannelSink::<u32>::channel();
        slot.subscribe(Arc::new(sink));
        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(!slot.deliver(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_errors_carry_code_and_message() {
        let mut slot = NotifierSlot::<u32>::new("test");
        let (sink, mut rx) = ChannelSink::<u32>::channel();
        slot.subscribe(Arc::new(sink));
        slot.deliver_error(&BeaconError::InvalidRegion("bad uuid".into()));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind, "INVALID_REGION");
        assert!(err.message.contains("bad uuid"));
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (sink, rx) = ChannelSink::<u32>::channel();
        drop(rx);
        sink.push(1);
        sink.push_error("X", "y");
    }
}
