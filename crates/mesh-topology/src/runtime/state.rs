use std::collections::{HashMap, HashSet};
use std::time::Duration;

use mesh_transport::{decode_hello, PeerId};
use tracing::{debug, info, warn};

use crate::admission::{resolve_role, ClosedBy, Phase, Role};
use crate::connection::ConnId;
use crate::reconnect::{ReconnectPolicy, ReconnectTicket};
use crate::registry::{PeerRef, PeerRegistry, PeerState};

use super::effect::MeshEffect;

/// Complete mesh state: pure logic, no async, no sockets.
///
/// Every `handle_*` method returns `Vec<MeshEffect>`. Nothing here touches
/// the network or a channel, so any interleaving of socket reports can be
/// replayed deterministically.
pub struct MeshState {
    local_id: PeerId,
    policy: ReconnectPolicy,
    registry: PeerRegistry,
    /// Every socket this node holds that has not reported closed yet.
    sockets: HashMap<ConnId, Phase>,
    /// Destroyed, close report still outstanding. Late frames are ignored.
    doomed: HashSet<ConnId>,
    next_conn: u64,
    next_ticket: u64,
}

impl MeshState {
    pub fn new(local_id: PeerId, policy: ReconnectPolicy) -> Self {
        Self {
            local_id,
            policy,
            registry: PeerRegistry::new(),
            sockets: HashMap::new(),
            doomed: HashSet::new(),
            next_conn: 0,
            next_ticket: 0,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Handshake phase of a socket that has not closed yet.
    pub fn phase(&self, conn: ConnId) -> Option<&Phase> {
        self.sockets.get(&conn)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// The admitted socket for `id`, if any.
    pub fn connection_of(&self, id: &PeerId) -> Option<ConnId> {
        self.registry.get(id).and_then(|peer| peer.socket())
    }

    fn allocate_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId::new(self.next_conn)
    }

    fn allocate_ticket(&mut self) -> ReconnectTicket {
        self.next_ticket += 1;
        ReconnectTicket::new(self.next_ticket)
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Make `id` a desired peer and dial it unless a socket is already bound.
    pub fn handle_add(&mut self, id: PeerId) -> Vec<MeshEffect> {
        if id == self.local_id {
            debug!("add: ignoring our own identity");
            return Vec::new();
        }
        let target = match id.dial_target() {
            Ok(target) => target,
            Err(e) => {
                warn!("add: {e}");
                return Vec::new();
            }
        };

        let mut effects = Vec::new();
        let (peer, cancelled) = self.registry.upsert(id, target);
        if let Some(ticket) = cancelled {
            effects.push(MeshEffect::CancelReconnect { ticket });
        }
        self.dial(&peer, None, &mut effects);
        effects
    }

    /// Stop maintaining `id`: disarm its timer and destroy its sockets.
    pub fn handle_remove(&mut self, id: &PeerId) -> Vec<MeshEffect> {
        if *id == self.local_id {
            return Vec::new();
        }
        let Some(removal) = self.registry.mark_for_removal(id) else {
            debug!("remove: {id} is not a known peer");
            return Vec::new();
        };
        info!("remove: {id} ({} socket(s) to close)", removal.sockets.len());

        let mut effects = Vec::new();
        if let Some(ticket) = removal.cancelled {
            effects.push(MeshEffect::CancelReconnect { ticket });
        }
        for conn in removal.sockets {
            self.destroy(conn, &mut effects);
        }
        effects
    }

    /// Stop listening and remove every peer.
    pub fn handle_destroy(&mut self) -> Vec<MeshEffect> {
        let mut effects = vec![MeshEffect::StopListening];
        for id in self.registry.ids() {
            effects.extend(self.handle_remove(&id));
        }
        effects
    }

    // ── Listener ─────────────────────────────────────────────────────────

    /// Register a freshly accepted socket and ask for its first frame.
    pub fn handle_accepted(&mut self) -> (ConnId, Vec<MeshEffect>) {
        let conn = self.allocate_conn();
        self.sockets.insert(conn, Phase::Accepting);
        (conn, vec![MeshEffect::ReadFrame { conn }])
    }

    // ── Socket reports ───────────────────────────────────────────────────

    /// The TCP connect of an outbound socket completed.
    pub fn handle_connected(&mut self, conn: ConnId) -> Vec<MeshEffect> {
        if let Some(phase) = self.sockets.get_mut(&conn) {
            if let Phase::Dialing { owner, role } = phase {
                *phase = Phase::after_hello(owner.clone(), *role);
            }
        }
        Vec::new()
    }

    /// A handshake frame arrived.
    pub fn handle_frame(&mut self, conn: ConnId, payload: &[u8]) -> Vec<MeshEffect> {
        let mut effects = Vec::new();
        if self.doomed.contains(&conn) {
            return effects;
        }
        let Some(phase) = self.sockets.get(&conn).cloned() else {
            return effects;
        };
        let remote = match decode_hello(payload) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("handshake: {conn}: {e}");
                self.destroy(conn, &mut effects);
                return effects;
            }
        };

        match phase {
            Phase::Accepting => self.accept(remote, conn, &mut effects),
            Phase::AwaitingHello { owner } => {
                if remote != owner.id {
                    warn!("handshake: {conn} dialled {} but {remote} answered", owner.id);
                    self.destroy(conn, &mut effects);
                } else if !self.registry.is_current(&owner) {
                    self.destroy(conn, &mut effects);
                } else {
                    self.accept(remote, conn, &mut effects);
                }
            }
            Phase::AwaitingReply { owner } => {
                if remote != owner.id {
                    warn!("handshake: {conn} dialled {} but {remote} replied", owner.id);
                    self.destroy(conn, &mut effects);
                } else if !self.registry.is_current(&owner) {
                    self.destroy(conn, &mut effects);
                } else {
                    self.ready(&owner, conn, &mut effects);
                }
            }
            Phase::Dialing { .. } | Phase::Ready { .. } => {
                debug!("handshake: unexpected frame on {conn}");
            }
        }
        effects
    }

    /// A socket is gone. Runs exactly once per socket.
    ///
    /// Only the peer's admitted or pending socket counts. A winner's dial
    /// that the remote hung up on mid-handshake lost a dial race: the
    /// remote's own dial is on its way, so no retry is counted. A quiet
    /// fallback redial covers the case where that dial never arrives.
    pub fn handle_closed(&mut self, conn: ConnId, closed_by: ClosedBy) -> Vec<MeshEffect> {
        let mut effects = Vec::new();
        self.doomed.remove(&conn);
        let Some(phase) = self.sockets.remove(&conn) else {
            return effects;
        };
        let Some(owner) = phase.owner().cloned() else {
            return effects;
        };
        let Some(peer) = self.registry.lookup_mut(&owner) else {
            return effects;
        };

        if peer.socket == Some(conn) {
            peer.socket = None;
            info!("mesh: {} disconnected ({conn})", owner.id);
            effects.push(MeshEffect::Disconnected {
                peer: owner.id.clone(),
                conn,
            });
        } else if peer.pending == Some(conn) {
            peer.pending = None;
        } else {
            return effects;
        }
        if peer.socket.is_some() {
            return effects;
        }

        match peer.state.clone() {
            PeerState::Removing => {
                if peer.is_quiesced() {
                    self.registry.forget(&owner);
                    debug!("registry: {} gone", owner.id);
                }
            }
            PeerState::Inbound => {
                if peer.pending.is_none() {
                    self.registry.forget(&owner);
                    debug!("registry: dropped inbound-only {}", owner.id);
                }
            }
            PeerState::Desired(_) => {
                let lost_race = closed_by == ClosedBy::Remote
                    && matches!(phase, Phase::AwaitingHello { .. });
                if lost_race {
                    let delay = self.policy.delay(peer.retries.max(1));
                    debug!("handshake: {} dropped our dial {conn}, awaiting theirs", owner.id);
                    self.arm_reconnect(owner, delay, &mut effects);
                } else {
                    peer.retries = peer.retries.saturating_add(1);
                    let retries = peer.retries;
                    let delay = self.policy.delay(retries);
                    info!("mesh: reconnecting to {} in {delay:?} (retry {retries})", owner.id);
                    let id = owner.id.clone();
                    self.arm_reconnect(owner, delay, &mut effects);
                    effects.push(MeshEffect::Reconnecting {
                        peer: id,
                        retries,
                        delay,
                    });
                }
            }
        }
        effects
    }

    /// Arm the redial timer for `owner`, replacing any armed one.
    fn arm_reconnect(&mut self, owner: PeerRef, delay: Duration, effects: &mut Vec<MeshEffect>) {
        let ticket = self.allocate_ticket();
        if let Some(peer) = self.registry.lookup_mut(&owner) {
            if let Some(stale) = peer.reconnect.replace(ticket) {
                effects.push(MeshEffect::CancelReconnect { ticket: stale });
            }
        }
        effects.push(MeshEffect::ScheduleReconnect {
            peer: owner,
            ticket,
            delay,
        });
    }

    /// A reconnect timer fired. Stale tickets are ignored.
    pub fn handle_reconnect_due(&mut self, peer: &PeerRef, ticket: ReconnectTicket) -> Vec<MeshEffect> {
        let mut effects = Vec::new();
        let Some(entry) = self.registry.lookup_mut(peer) else {
            return effects;
        };
        if entry.reconnect != Some(ticket) {
            return effects;
        }
        entry.reconnect = None;
        debug!("reconnect: redialling {} (retry {})", peer.id, entry.retries);
        self.dial(peer, None, &mut effects);
        effects
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Process a hello that identifies `remote` on `conn`.
    fn accept(&mut self, remote: PeerId, conn: ConnId, effects: &mut Vec<MeshEffect>) {
        if remote == self.local_id {
            warn!("handshake: {conn} claims our own identity");
            self.discard(conn, effects);
            return;
        }
        let peer = self.registry.resolve_inbound(&remote);
        match resolve_role(&self.local_id, &remote) {
            Role::Loser => self.dial(&peer, Some(conn), effects),
            Role::Winner => {
                effects.push(MeshEffect::SendHello { conn });
                self.ready(&peer, conn, effects);
            }
        }
    }

    /// Bind a socket to `peer` and start the handshake on it.
    ///
    /// With `existing = None` a new outbound socket is opened, but only for
    /// desired peers. A peer that already has a socket, admitted or pending,
    /// is left alone and `existing` is discarded.
    fn dial(&mut self, peer: &PeerRef, existing: Option<ConnId>, effects: &mut Vec<MeshEffect>) {
        let Some(entry) = self.registry.lookup(peer) else {
            if let Some(conn) = existing {
                self.discard(conn, effects);
            }
            return;
        };
        if entry.socket().is_some() || entry.pending().is_some() || entry.state() == &PeerState::Removing {
            if let Some(conn) = existing {
                debug!("dial: {} already has a socket, dropping {conn}", peer.id);
                self.discard(conn, effects);
            }
            return;
        }
        let target = entry.dial_target().cloned();
        let role = resolve_role(&self.local_id, &peer.id);

        let (conn, phase) = match (existing, target) {
            (Some(conn), _) => (conn, Phase::after_hello(peer.clone(), role)),
            (None, Some(target)) => {
                let conn = self.allocate_conn();
                debug!("dial: {} via {conn}", peer.id);
                effects.push(MeshEffect::Connect { conn, target });
                (
                    conn,
                    Phase::Dialing {
                        owner: peer.clone(),
                        role,
                    },
                )
            }
            (None, None) => return,
        };

        if let Some(entry) = self.registry.lookup_mut(peer) {
            if let Some(ticket) = entry.reconnect.take() {
                effects.push(MeshEffect::CancelReconnect { ticket });
            }
            entry.pending = Some(conn);
        }
        self.sockets.insert(conn, phase);
        effects.push(MeshEffect::SendHello { conn });
        effects.push(MeshEffect::ReadFrame { conn });
    }

    /// Admit `conn` as the canonical socket of `peer`.
    fn ready(&mut self, peer: &PeerRef, conn: ConnId, effects: &mut Vec<MeshEffect>) {
        let Some(entry) = self.registry.lookup_mut(peer) else {
            self.discard(conn, effects);
            return;
        };
        entry.retries = 0;
        let cancelled = entry.reconnect.take();
        let previous = entry.socket.replace(conn).filter(|old| *old != conn);
        let superseded = entry.pending.take().filter(|pending| *pending != conn);

        if let Some(ticket) = cancelled {
            effects.push(MeshEffect::CancelReconnect { ticket });
        }
        for old in previous.into_iter().chain(superseded) {
            debug!("admission: {conn} supersedes {old} for {}", peer.id);
            self.destroy(old, effects);
        }
        self.sockets.insert(conn, Phase::Ready { owner: peer.clone() });
        info!("mesh: {} connected ({conn})", peer.id);
        effects.push(MeshEffect::Promote {
            conn,
            peer: peer.id.clone(),
        });
    }

    /// Destroy a socket; its close report still runs the usual cleanup.
    fn destroy(&mut self, conn: ConnId, effects: &mut Vec<MeshEffect>) {
        if self.sockets.contains_key(&conn) {
            self.doomed.insert(conn);
        }
        effects.push(MeshEffect::Destroy { conn });
    }

    /// Destroy a socket that is bound to no peer. Its close report is ignored.
    fn discard(&mut self, conn: ConnId, effects: &mut Vec<MeshEffect>) {
        self.sockets.remove(&conn);
        self.doomed.remove(&conn);
        effects.push(MeshEffect::Destroy { conn });
    }
}
