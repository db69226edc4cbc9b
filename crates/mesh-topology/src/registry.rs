/// Peer registry: who should be connected, and through which sockets.
///
/// Pure data: no I/O, no timers. The admission state machine in
/// [`crate::runtime`] drives every mutation.
use std::collections::HashMap;

use mesh_transport::{DialTarget, PeerId};

use crate::connection::ConnId;
use crate::reconnect::ReconnectTicket;

// ── Peer entries ──────────────────────────────────────────────────────

/// Incarnation of a peer entry.
///
/// Bumped every time an identity is (re)created, so the sockets and timers
/// of a removed entry never act on its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Incarnation(u64);

/// Stable reference to one incarnation of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRef {
    pub id: PeerId,
    pub incarnation: Incarnation,
}

/// Lifecycle of a peer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// Added by the application; dialled, and redialled after every loss.
    Desired(DialTarget),
    /// Known only because it connected to us. Never redialled.
    Inbound,
    /// Removed by the application; waiting for its sockets to report closed.
    Removing,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    incarnation: Incarnation,
    pub(crate) state: PeerState,
    /// Consecutive reconnect attempts since the last successful admission.
    pub(crate) retries: u32,
    /// The admitted socket.
    pub(crate) socket: Option<ConnId>,
    /// A socket bound to this peer but still in the handshake.
    pub(crate) pending: Option<ConnId>,
    pub(crate) reconnect: Option<ReconnectTicket>,
}

impl Peer {
    fn new(id: PeerId, incarnation: Incarnation, state: PeerState) -> Self {
        Self {
            id,
            incarnation,
            state,
            retries: 0,
            socket: None,
            pending: None,
            reconnect: None,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: self.id.clone(),
            incarnation: self.incarnation,
        }
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn socket(&self) -> Option<ConnId> {
        self.socket
    }

    pub fn pending(&self) -> Option<ConnId> {
        self.pending
    }

    pub fn reconnect(&self) -> Option<ReconnectTicket> {
        self.reconnect
    }

    /// Where to redial; `None` for peers we never dial.
    pub fn dial_target(&self) -> Option<&DialTarget> {
        match &self.state {
            PeerState::Desired(target) => Some(target),
            _ => None,
        }
    }

    /// No socket of any kind is bound to this entry.
    pub fn is_quiesced(&self) -> bool {
        self.socket.is_none() && self.pending.is_none()
    }
}

/// Outcome of [`PeerRegistry::mark_for_removal`].
#[derive(Debug)]
pub struct Removal {
    pub peer: PeerRef,
    /// Reconnect timer that must be disarmed.
    pub cancelled: Option<ReconnectTicket>,
    /// Sockets that must be destroyed; their close reports finish the removal.
    pub sockets: Vec<ConnId>,
}

// ── Registry ──────────────────────────────────────────────────────────

/// All known peers, keyed by identity, plus removed entries still draining.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    active: HashMap<PeerId, Peer>,
    draining: HashMap<Incarnation, Peer>,
    next_incarnation: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, id: PeerId, state: PeerState) -> Peer {
        self.next_incarnation += 1;
        Peer::new(id, Incarnation(self.next_incarnation), state)
    }

    /// Add a desired peer or refresh an existing entry.
    ///
    /// Refreshing replaces the dial target, resets the retry counter and
    /// disarms the reconnect timer (returned so the caller can cancel it).
    /// Sockets are left untouched.
    pub fn upsert(&mut self, id: PeerId, target: DialTarget) -> (PeerRef, Option<ReconnectTicket>) {
        if let Some(peer) = self.active.get_mut(&id) {
            peer.state = PeerState::Desired(target);
            peer.retries = 0;
            return (peer.peer_ref(), peer.reconnect.take());
        }
        let peer = self.fresh(id.clone(), PeerState::Desired(target));
        let peer_ref = peer.peer_ref();
        self.active.insert(id, peer);
        (peer_ref, None)
    }

    /// Entry for an identity that just announced itself on an inbound
    /// socket, created as [`PeerState::Inbound`] if unknown.
    pub fn resolve_inbound(&mut self, id: &PeerId) -> PeerRef {
        if let Some(peer) = self.active.get(id) {
            return peer.peer_ref();
        }
        let peer = self.fresh(id.clone(), PeerState::Inbound);
        let peer_ref = peer.peer_ref();
        self.active.insert(id.clone(), peer);
        peer_ref
    }

    /// Take an identity out of the lookup table.
    ///
    /// An entry with sockets moves to the draining set until they close; an
    /// entry without sockets is dropped at once. `None` when unknown.
    pub fn mark_for_removal(&mut self, id: &PeerId) -> Option<Removal> {
        let mut peer = self.active.remove(id)?;
        peer.state = PeerState::Removing;
        let removal = Removal {
            peer: peer.peer_ref(),
            cancelled: peer.reconnect.take(),
            sockets: peer.socket.iter().chain(peer.pending.iter()).copied().collect(),
        };
        if !peer.is_quiesced() {
            self.draining.insert(peer.incarnation, peer);
        }
        Some(removal)
    }

    /// The current entry for an identity.
    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.active.get(id)
    }

    /// Resolve a reference to its entry, current or draining, if that
    /// incarnation still exists.
    pub fn lookup(&self, peer: &PeerRef) -> Option<&Peer> {
        match self.active.get(&peer.id) {
            Some(p) if p.incarnation == peer.incarnation => Some(p),
            _ => self.draining.get(&peer.incarnation),
        }
    }

    pub fn lookup_mut(&mut self, peer: &PeerRef) -> Option<&mut Peer> {
        let current = self
            .active
            .get(&peer.id)
            .is_some_and(|p| p.incarnation == peer.incarnation);
        if current {
            self.active.get_mut(&peer.id)
        } else {
            self.draining.get_mut(&peer.incarnation)
        }
    }

    /// `peer` is the live entry for its identity (not removed, not replaced).
    pub fn is_current(&self, peer: &PeerRef) -> bool {
        self.active
            .get(&peer.id)
            .is_some_and(|p| p.incarnation == peer.incarnation)
    }

    /// Drop an entry for good.
    pub fn forget(&mut self, peer: &PeerRef) -> Option<Peer> {
        if self.is_current(peer) {
            return self.active.remove(&peer.id);
        }
        self.draining.remove(&peer.incarnation)
    }

    /// All current entries.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.active.values()
    }

    /// Identities of all current entries.
    pub fn ids(&self) -> Vec<PeerId> {
        self.active.keys().cloned().collect()
    }

    /// Admitted sockets of current entries.
    pub fn live_connections(&self) -> Vec<(PeerId, ConnId)> {
        self.active
            .values()
            .filter_map(|p| p.socket.map(|conn| (p.id.clone(), conn)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Removed entries still waiting for their sockets to close.
    pub fn draining_len(&self) -> usize {
        self.draining.len()
    }
}
