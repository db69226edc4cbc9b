//! Self-healing full mesh over TCP.
//!
//! Every node keeps exactly one live connection to every peer it was told
//! about. Two nodes that dial each other at the same moment settle on a
//! single socket by comparing identities; a lost connection to a desired
//! peer is redialled with exponential backoff until the peer is removed.
//!
//! Layers, bottom-up:
//! - [`registry`]: who should be connected and through which socket.
//! - [`admission`]: the identity handshake and simultaneous-dial resolution.
//! - [`reconnect`]: backoff policy and redial timers.
//! - [`runtime`]: the event loop and the [`Topology`] facade.

pub mod admission;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod runtime;

pub use admission::{resolve_role, ClosedBy, Phase, Role};
pub use connection::{ConnId, Connection, InboundFrame};
pub use error::TopologyError;
pub use reconnect::{ReconnectPolicy, ReconnectTicket};
pub use registry::{Incarnation, Peer, PeerRef, PeerRegistry, PeerState};
pub use runtime::{
    MeshEffect, MeshState, Topology, TopologyChannels, TopologyConfig, TopologyEvent,
    TopologyHandle,
};

pub use mesh_transport::{DialTarget, PeerId, TransportConfig, TransportError};
