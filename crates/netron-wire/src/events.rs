//! Peer event channel for context lifecycle and connection events.
//!
//! Every peer owns one broadcast channel. Its dispatch loop publishes events
//! in the order they arrive on the wire, after folding them into the peer's
//! definition maps. Listeners subscribe with a filter on the event name, so
//! any number of independent listeners can coexist.

use netron_types::{DefId, Definition};
use tokio::sync::broadcast;
use tracing::warn;

/// Name of the context attach event.
pub const CONTEXT_ATTACH: &str = "context:attach";
/// Name of the context detach event.
pub const CONTEXT_DETACH: &str = "context:detach";
/// Name of the peer connected event.
pub const PEER_CONNECT: &str = "peer:connect";
/// Name of the peer disconnected event.
pub const PEER_DISCONNECT: &str = "peer:disconnect";

/// An event observed on one peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// A strong context became reachable.
    ContextAttach {
        ctx_id: String,
        definition: Definition,
    },
    /// A strong context went away.
    ContextDetach { ctx_id: String, def_id: DefId },
    /// The peer came online.
    Connected { peer_id: String },
    /// The peer went offline.
    Disconnected { peer_id: String },
}

impl RemoteEvent {
    /// Event name used for filtering.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContextAttach { .. } => CONTEXT_ATTACH,
            Self::ContextDetach { .. } => CONTEXT_DETACH,
            Self::Connected { .. } => PEER_CONNECT,
            Self::Disconnected { .. } => PEER_DISCONNECT,
        }
    }
}

/// The event channel of one peer. Clones share the channel.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    sender: broadcast::Sender<RemoteEvent>,
}

impl PeerEvents {
    /// Create a channel buffering up to `capacity` events per listener.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver an event to every current listener.
    pub fn publish(&self, event: RemoteEvent) {
        // No listeners is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to one named event.
    pub fn on_remote(&self, event_name: &str) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            filter: Some(event_name.to_string()),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to context attach events.
    pub fn on_context_attach(&self) -> EventSubscription {
        self.on_remote(CONTEXT_ATTACH)
    }

    /// Subscribe to context detach events.
    pub fn on_context_detach(&self) -> EventSubscription {
        self.on_remote(CONTEXT_DETACH)
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// What a listener gets from [`EventSubscription::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A matching event.
    Event(RemoteEvent),
    /// The listener fell behind and this many events were dropped, matching
    /// or not. State derived from events must be re-read.
    Lagged(u64),
}

/// A filtered listener on a peer's event channel.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<RemoteEvent>,
    filter: Option<String>,
}

impl EventSubscription {
    /// Wait for the next matching event or a lag report. Returns `None`
    /// once the peer is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Delivery::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Delivery::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the next matching event, skipping over lag. Returns `None`
    /// once the peer is gone.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        loop {
            match self.next().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::Lagged(skipped) => {
                    warn!(skipped, "Event listener lagged, events dropped");
                }
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<RemoteEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &RemoteEvent) -> bool {
        match &self.filter {
            Some(name) => event.name() == name,
            None => true,
        }
    }
}
