//! Netron: distributed objects over a framed JSON wire protocol.
//!
//! A node attaches local contexts and publishes them to connected peers.
//! Peers reach those contexts through interface proxies, and objects passed
//! by reference are minted as weak definitions on the fly. Interfaces
//! received from one peer can be handed to another; the node relays calls
//! through a remote stub so the third party never needs a direct link.
//!
//! ## Architecture
//!
//! - **Netron**: local node; handshakes, accept loop and request serving
//! - **DefinitionRegistry**: local contexts and stubs, keyed by definition id
//! - **Peer**: remote or own endpoint with definitions and interfaces
//! - **Interface**: proxy bound to one definition on one peer
//! - **RequestCorrelator**: matches responses to pending calls
//! - **WireMessage**: JSON-framed protocol messages

pub mod config;
pub mod context;
pub mod correlator;
pub mod events;
pub mod forward;
pub mod interface;
pub mod message;
pub mod node;
pub mod peer;
pub mod peers;
pub mod registry;
pub mod transport;

pub use config::load_config;
pub use context::{Context, Value};
pub use correlator::RequestCorrelator;
pub use events::{Delivery, EventSubscription, PeerEvents, RemoteEvent};
pub use interface::Interface;
pub use message::{MetaEntry, WireMessage, WireNotification, WireRequest, WireResponse};
pub use node::Netron;
pub use peer::{OwnPeer, Peer, PeerStatus, RemotePeer};
pub use peers::PeerRegistry;
pub use registry::{DefinitionRegistry, StubTarget};
pub use transport::{Connection, MessageSink, MessageSource, WireError};

pub use netron_types::{
    ContextDescriptor, DefId, Definition, NetronConfig, NetronError, NetronResult, RemoteError,
    WireValue,
};
