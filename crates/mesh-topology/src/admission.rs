//! Admission handshake.
//!
//! Each side writes its identity as the first frame of a socket. When two
//! nodes dial each other at once, the lexicographically greater identity
//! wins: its side answers the loser's hello and keeps that socket, while
//! the loser drops any extra socket it sees for the same peer.
//!
//! Socket phases:
//!
//! ```text
//! accepted ──► Accepting ──hello──► (winner) reply ──► Ready
//!                              └──► (loser) AwaitingReply ──reply──► Ready
//! dialled  ──► Dialing ──connected──► AwaitingHello (winner)
//!                                 └─► AwaitingReply (loser)
//! ```

use mesh_transport::PeerId;

use crate::registry::PeerRef;

/// Which side of a peer pair answers the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Local identity is greater: read the remote hello, reply, go ready.
    Winner,
    /// Local identity is smaller: wait for the remote's reply.
    Loser,
}

/// Resolve the local role against `remote`.
///
/// Equal identities never get here; a hello carrying our own identity is
/// rejected earlier.
pub fn resolve_role(local: &PeerId, remote: &PeerId) -> Role {
    if local > remote {
        Role::Winner
    } else {
        Role::Loser
    }
}

/// Handshake phase of one physical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Inbound, identity unknown until the first frame.
    Accepting,
    /// Outbound, TCP connect in flight.
    Dialing { owner: PeerRef, role: Role },
    /// Our hello is out; the remote's hello decides the rest.
    AwaitingHello { owner: PeerRef },
    /// Our hello is out; waiting for the winner's reply.
    AwaitingReply { owner: PeerRef },
    /// Admitted.
    Ready { owner: PeerRef },
}

impl Phase {
    /// Phase a socket enters once our hello is written.
    pub fn after_hello(owner: PeerRef, role: Role) -> Self {
        match role {
            Role::Winner => Phase::AwaitingHello { owner },
            Role::Loser => Phase::AwaitingReply { owner },
        }
    }

    /// The peer entry this socket is bound to.
    pub fn owner(&self) -> Option<&PeerRef> {
        match self {
            Phase::Accepting => None,
            Phase::Dialing { owner, .. }
            | Phase::AwaitingHello { owner }
            | Phase::AwaitingReply { owner }
            | Phase::Ready { owner } => Some(owner),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Phase::Ready { .. })
    }
}

/// Which end brought a socket down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// Destroyed here, timed out, failed to connect or hit an I/O error.
    Local,
    /// The remote closed the stream cleanly.
    Remote,
}
