//! Station bus: the serialized inbox of the decision engine plus a lossy
//! broadcast lane of state changes.
//!
//! Every producer (scale processor handlers, signal bus handlers, the record
//! store) publishes [`Event`] envelopes through an [`EventPublisher`].  All
//! of them land in one unbounded FIFO read by exactly one consumer, so the
//! engine sees events in acceptance order and never two at once.  Producers
//! never wait on the consumer.
//!
//! State changes go the other way on a [`tokio::sync::broadcast`] channel:
//! observers that fall behind lose old changes instead of slowing the engine.

use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use weighgate_types::{Event, StateChange, StationError, StationEvent};

/// Buffered state changes per observer before the oldest are dropped.
const STATE_LANE_CAPACITY: usize = 64;

/// Cloneable handle to both lanes.
#[derive(Clone, Debug)]
pub struct StationBus {
    inbox: mpsc::UnboundedSender<Event>,
    states: broadcast::Sender<StateChange>,
}

/// The single consumer end of the inbox.
#[derive(Debug)]
pub struct StationInbox {
    receiver: mpsc::UnboundedReceiver<Event>,
}

/// A [`StationBus`] bound to a source name, used by one producer.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    source: String,
    bus: StationBus,
}

impl StationBus {
    pub fn new() -> (Self, StationInbox) {
        let (inbox, receiver) = mpsc::unbounded_channel();
        let (states, _) = broadcast::channel(STATE_LANE_CAPACITY);
        (Self { inbox, states }, StationInbox { receiver })
    }

    /// Queue `event` for the engine.
    ///
    /// # Errors
    ///
    /// [`StationError::Channel`] once the inbox has been dropped.
    pub fn publish(&self, event: Event) -> Result<(), StationError> {
        self.inbox
            .send(event)
            .map_err(|e| StationError::Channel(format!("station inbox closed: {:?}", e.0.payload)))
    }

    pub fn publisher(&self, source: impl Into<String>) -> EventPublisher {
        EventPublisher {
            source: source.into(),
            bus: self.clone(),
        }
    }

    /// Broadcast a transition. Returns how many observers got it; zero
    /// observers is normal.
    pub fn announce(&self, change: StateChange) -> usize {
        self.states.send(change).unwrap_or(0)
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.states.subscribe()
    }
}

impl StationInbox {
    /// Next event, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Stop accepting new events; already queued ones can still be read.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl EventPublisher {
    /// Wrap and queue `payload`.  A closed inbox is logged, not returned:
    /// publishers run inside notification handlers with nowhere to report.
    pub fn emit(&self, payload: StationEvent) {
        if let Err(e) = self.bus.publish(Event::new(self.source.clone(), payload)) {
            warn!(source = %self.source, error = %e, "event dropped");
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weighgate_types::StationState;

    #[tokio::test]
    async fn inbox_preserves_acceptance_order() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, mut inbox) = StationBus::new();
        let scale = bus.publisher("scale");
        let panel = bus.publisher("panel");

        scale.emit(StationEvent::ScaleConnected);
        panel.emit(StationEvent::ButtonPressed);
        scale.emit(StationEvent::WeightReceived(12.5));

        let first = inbox.recv().await.ok_or("inbox empty")?;
        assert_eq!(first.payload, StationEvent::ScaleConnected);
        assert_eq!(first.source, "scale");
        let second = inbox.recv().await.ok_or("inbox empty")?;
        assert_eq!(second.payload, StationEvent::ButtonPressed);
        assert_eq!(second.source, "panel");
        let third = inbox.recv().await.ok_or("inbox empty")?;
        assert_eq!(third.payload, StationEvent::WeightReceived(12.5));
        Ok(())
    }

    #[tokio::test]
    async fn publish_after_inbox_dropped_is_channel_error() {
        let (bus, inbox) = StationBus::new();
        drop(inbox);
        let err = bus
            .publish(Event::new("test", StationEvent::DatabaseRestored))
            .unwrap_err();
        assert!(matches!(err, StationError::Channel(_)));
        // emit only logs
        bus.publisher("test").emit(StationEvent::DatabaseRestored);
    }

    #[tokio::test]
    async fn state_changes_reach_observers() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _inbox) = StationBus::new();
        let change = StateChange {
            from: StationState::Disconnected,
            to: StationState::Idle,
        };
        assert_eq!(bus.announce(change), 0);

        let mut rx = bus.subscribe_states();
        assert_eq!(bus.announce(change), 1);
        assert_eq!(rx.recv().await?, change);
        Ok(())
    }
}
