//! Connection state and the channel event bus.
//!
//! The supervisor is the only writer of [`ConnectionState`]; everyone else
//! reads it through a `watch` receiver. Everything else that other components
//! want to observe is published as a [`ChannelEvent`] on a broadcast bus:
//! subscribers see events in publish order, and a lagging or dropped
//! subscriber never holds up the others.

use crate::gate::AutonomousAction;
use crate::message::Message;
use std::fmt;
use tokio::sync::{broadcast, watch};

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Faulted,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// An attempt is currently in flight
    pub fn is_attempting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something observable happened on the channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Inbound message that matched no outstanding request
    Unsolicited(Message),
    /// A command was dropped after exhausting its delivery attempts
    DeliveryFailed { correlation_id: String, attempts: u32 },
    /// An autonomous action was withheld by the gate
    ApprovalRequired(AutonomousAction),
    /// An inbound frame was rejected at the boundary
    Rejected { reason: String },
}

/// Publisher side of the event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber; having none is not an error
    pub fn publish(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Single-writer cell holding the connection state
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    events: EventBus,
}

impl StateCell {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx, events }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `to`, publishing a StateChanged event if it differs
    pub fn set(&self, to: ConnectionState) -> ConnectionState {
        let from = self.tx.send_replace(to);
        if from != to {
            tracing::debug!(%from, %to, "connection state changed");
            self.events.publish(ChannelEvent::StateChanged { from, to });
        }
        from
    }

    /// Move to `to` only if the current state satisfies `pred`
    pub fn set_if(&self, to: ConnectionState, pred: impl FnOnce(ConnectionState) -> bool) -> bool {
        let mut from = to;
        let changed = self.tx.send_if_modified(|state| {
            if pred(*state) && *state != to {
                from = *state;
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(%from, %to, "connection state changed");
            self.events.publish(ChannelEvent::StateChanged { from, to });
        }
        changed
    }
}

/// Suspend until the watched state is Connected
pub async fn wait_connected(rx: &mut watch::Receiver<ConnectionState>) -> bool {
    rx.wait_for(|state| state.is_connected()).await.is_ok()
}
