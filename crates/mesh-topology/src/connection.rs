use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use mesh_transport::{Endpoints, PeerId, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::TopologyError;

/// Identifier of one physical socket, unique within a topology instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An admitted connection to a peer.
///
/// Cheap to clone. Closing it (from any clone) destroys the socket; if the
/// peer is still desired, the topology redials it.
#[derive(Clone)]
pub struct Connection {
    id: ConnId,
    peer: PeerId,
    endpoints: Endpoints,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    max_frame_size: usize,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        peer: PeerId,
        endpoints: Endpoints,
        outbound: mpsc::Sender<Bytes>,
        closed: CancellationToken,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            peer,
            endpoints,
            outbound,
            closed,
            max_frame_size,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Identity of the remote node.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoints.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoints.remote
    }

    /// Queue one frame for the peer.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), TopologyError> {
        let payload = payload.into();
        if payload.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(payload)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Destroy the underlying socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the socket is gone, whoever closed it.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn closed_error(&self) -> TopologyError {
        TopologyError::ConnectionClosed {
            peer: self.peer.clone(),
            conn: self.id,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("local", &self.endpoints.local)
            .field("remote", &self.endpoints.remote)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

/// A frame received on an admitted connection.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: PeerId,
    pub conn: ConnId,
    pub payload: Bytes,
}
