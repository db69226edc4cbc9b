//! Deterministic in-memory network for replaying the handshake.
//!
//! Drives several `MeshState`s against each other with no sockets and no
//! clock. Deliveries wait in one queue; each step takes one, at random when
//! seeded, while every socket still sees its own deliveries in order (as a
//! TCP stream would).

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use mesh_transport::{encode_hello, DialTarget, PeerId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::admission::ClosedBy;
use crate::connection::ConnId;
use crate::reconnect::{ReconnectPolicy, ReconnectTicket};
use crate::registry::{PeerRef, PeerState};

use super::effect::MeshEffect;
use super::state::MeshState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SocketKey {
    node: usize,
    conn: ConnId,
}

enum Delivery {
    /// A dialled connect reaches the target's listener.
    Accept { dialer: SocketKey, target: usize },
    Connected(SocketKey),
    Data { to: SocketKey, payload: Bytes },
    Closed { key: SocketKey, by: ClosedBy },
    ReconnectDue {
        node: usize,
        peer: PeerRef,
        ticket: ReconnectTicket,
    },
}

impl Delivery {
    /// Deliveries sharing a key keep their relative order.
    fn key(&self) -> Option<SocketKey> {
        match self {
            Delivery::Accept { dialer, .. } => Some(*dialer),
            Delivery::Connected(key) | Delivery::Closed { key, .. } => Some(*key),
            Delivery::Data { to, .. } => Some(*to),
            Delivery::ReconnectDue { .. } => None,
        }
    }
}

#[derive(Default)]
struct SimSocket {
    remote: Option<SocketKey>,
    open: bool,
    reported: bool,
    promoted: bool,
    reads: usize,
    inbox: Vec<Bytes>,
    unsent: Vec<Bytes>,
}

pub(crate) struct SimNode {
    pub state: MeshState,
    sockets: HashMap<ConnId, SimSocket>,
    timers: HashMap<ReconnectTicket, PeerRef>,
    listening: bool,
    /// Promote / Reconnecting / Disconnected effects, in order.
    pub log: Vec<MeshEffect>,
}

impl SimNode {
    fn open_sockets(&self) -> usize {
        self.sockets.values().filter(|s| s.open).count()
    }
}

pub(crate) struct SimNet {
    nodes: Vec<SimNode>,
    queue: Vec<Delivery>,
    rng: Option<StdRng>,
}

impl SimNet {
    /// Nodes listening under `ids`. `seed = None` delivers in FIFO order.
    pub fn new(ids: &[&str], seed: Option<u64>) -> Self {
        let nodes = ids
            .iter()
            .map(|id| SimNode {
                state: MeshState::new(PeerId::from(*id), ReconnectPolicy::default()),
                sockets: HashMap::new(),
                timers: HashMap::new(),
                listening: true,
                log: Vec::new(),
            })
            .collect();
        Self {
            nodes,
            queue: Vec::new(),
            rng: seed.map(StdRng::seed_from_u64),
        }
    }

    pub fn node(&self, ix: usize) -> &SimNode {
        &self.nodes[ix]
    }

    fn id(&self, ix: usize) -> PeerId {
        self.nodes[ix].state.local_id().clone()
    }

    // ── Application actions ─────────────────────────────────────────────

    pub fn add(&mut self, node: usize, peer: usize) {
        let id = self.id(peer);
        let effects = self.nodes[node].state.handle_add(id);
        self.apply(node, effects);
    }

    pub fn remove(&mut self, node: usize, peer: usize) {
        let id = self.id(peer);
        let effects = self.nodes[node].state.handle_remove(&id);
        self.apply(node, effects);
    }

    pub fn destroy(&mut self, node: usize) {
        let effects = self.nodes[node].state.handle_destroy();
        self.apply(node, effects);
    }

    /// Break the admitted link from `node` to `peer` from the outside.
    pub fn sever(&mut self, node: usize, peer: usize) {
        let id = self.id(peer);
        let conn = self.nodes[node]
            .state
            .connection_of(&id)
            .expect("no admitted link to sever");
        self.close(SocketKey { node, conn });
    }

    /// Add every ordered pair at once: the worst case for dial races.
    pub fn add_all(&mut self) {
        let n = self.nodes.len();
        for a in 0..n {
            for b in 0..n {
                if a != b {
                    self.add(a, b);
                }
            }
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────────

    /// Deliver until the queue is empty.
    pub fn settle(&mut self) {
        let mut steps = 0;
        while !self.queue.is_empty() {
            steps += 1;
            assert!(steps < 100_000, "network never settles");
            self.step();
        }
    }

    /// Forget logged effects, e.g. those of the initial dial race.
    pub fn clear_logs(&mut self) {
        for node in &mut self.nodes {
            node.log.clear();
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.nodes.iter().map(|n| n.timers.len()).sum()
    }

    /// Fire every armed timer.
    pub fn fire_timers(&mut self) {
        for node in 0..self.nodes.len() {
            let timers: Vec<_> = self.nodes[node].timers.drain().collect();
            for (ticket, peer) in timers {
                self.queue.push(Delivery::ReconnectDue { node, peer, ticket });
            }
        }
    }

    /// Settle, firing timers in between, until nothing is left to do.
    pub fn run(&mut self) {
        for _ in 0..32 {
            self.settle();
            if self.pending_timers() == 0 {
                return;
            }
            self.fire_timers();
        }
        panic!("reconnect timers never stop");
    }

    fn step(&mut self) {
        let pick = match &mut self.rng {
            Some(rng) => rng.random_range(0..self.queue.len()),
            None => 0,
        };
        let ix = match self.queue[pick].key() {
            Some(key) => self
                .queue
                .iter()
                .position(|d| d.key() == Some(key))
                .unwrap_or(pick),
            None => pick,
        };
        let delivery = self.queue.remove(ix);
        self.deliver(delivery);
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Accept { dialer, target } => {
                if !self.socket(dialer).open {
                    return;
                }
                if !self.nodes[target].listening {
                    self.close(dialer);
                    return;
                }
                let (conn, effects) = self.nodes[target].state.handle_accepted();
                let accepted = SocketKey { node: target, conn };
                self.nodes[target].sockets.insert(
                    conn,
                    SimSocket {
                        remote: Some(dialer),
                        open: true,
                        ..SimSocket::default()
                    },
                );
                let sock = self.socket_mut(dialer);
                sock.remote = Some(accepted);
                let unsent = std::mem::take(&mut sock.unsent);
                self.queue.push(Delivery::Connected(dialer));
                for payload in unsent {
                    self.queue.push(Delivery::Data {
                        to: accepted,
                        payload,
                    });
                }
                self.apply(target, effects);
            }
            Delivery::Connected(key) => {
                if self.socket(key).open {
                    let effects = self.nodes[key.node].state.handle_connected(key.conn);
                    self.apply(key.node, effects);
                }
            }
            Delivery::Data { to, payload } => {
                if self.socket(to).open {
                    self.socket_mut(to).inbox.push(payload);
                    self.pump(to);
                }
            }
            Delivery::Closed { key, by } => {
                let sock = self.socket_mut(key);
                sock.open = false;
                if sock.reported {
                    return;
                }
                sock.reported = true;
                let effects = self.nodes[key.node].state.handle_closed(key.conn, by);
                self.apply(key.node, effects);
            }
            Delivery::ReconnectDue { node, peer, ticket } => {
                let effects = self.nodes[node].state.handle_reconnect_due(&peer, ticket);
                self.apply(node, effects);
            }
        }
    }

    // ── Effects ─────────────────────────────────────────────────────────

    fn apply(&mut self, node: usize, effects: Vec<MeshEffect>) {
        let mut to_pump = Vec::new();
        for effect in effects {
            match effect {
                MeshEffect::Connect { conn, ref target } => {
                    let key = SocketKey { node, conn };
                    self.nodes[node].sockets.insert(
                        conn,
                        SimSocket {
                            open: true,
                            ..SimSocket::default()
                        },
                    );
                    match self.find(target) {
                        Some(target) => self.queue.push(Delivery::Accept { dialer: key, target }),
                        None => self.close(key),
                    }
                }
                MeshEffect::SendHello { conn } => {
                    let key = SocketKey { node, conn };
                    let payload = encode_hello(self.nodes[node].state.local_id());
                    let sock = self.socket(key);
                    if !sock.open {
                        continue;
                    }
                    match sock.remote {
                        Some(to) => self.queue.push(Delivery::Data { to, payload }),
                        None => self.socket_mut(key).unsent.push(payload),
                    }
                }
                MeshEffect::ReadFrame { conn } => {
                    let key = SocketKey { node, conn };
                    self.socket_mut(key).reads += 1;
                    to_pump.push(key);
                }
                MeshEffect::Promote { conn, .. } => {
                    self.socket_mut(SocketKey { node, conn }).promoted = true;
                    self.nodes[node].log.push(effect);
                }
                MeshEffect::Destroy { conn } => self.close(SocketKey { node, conn }),
                MeshEffect::ScheduleReconnect { ref peer, ticket, .. } => {
                    self.nodes[node].timers.insert(ticket, peer.clone());
                }
                MeshEffect::CancelReconnect { ticket } => {
                    self.nodes[node].timers.remove(&ticket);
                }
                MeshEffect::Reconnecting { .. } | MeshEffect::Disconnected { .. } => {
                    self.nodes[node].log.push(effect);
                }
                MeshEffect::StopListening => self.nodes[node].listening = false,
            }
        }
        for key in to_pump {
            self.pump(key);
        }
    }

    /// Hand buffered frames to the state machine, one per outstanding read.
    fn pump(&mut self, key: SocketKey) {
        loop {
            let sock = self.socket_mut(key);
            if !sock.open || sock.promoted || sock.reads == 0 || sock.inbox.is_empty() {
                return;
            }
            sock.reads -= 1;
            let payload = sock.inbox.remove(0);
            let effects = self.nodes[key.node].state.handle_frame(key.conn, &payload);
            self.apply(key.node, effects);
        }
    }

    /// Close locally at once; the remote end learns after any data in flight.
    fn close(&mut self, key: SocketKey) {
        let sock = self.socket_mut(key);
        if !sock.open {
            return;
        }
        sock.open = false;
        let remote = sock.remote;
        self.queue.push(Delivery::Closed {
            key,
            by: ClosedBy::Local,
        });
        if let Some(remote) = remote {
            self.queue.push(Delivery::Closed {
                key: remote,
                by: ClosedBy::Remote,
            });
        }
    }

    fn find(&self, target: &DialTarget) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.state.local_id().dial_target().ok().as_ref() == Some(target))
    }

    fn socket(&self, key: SocketKey) -> &SimSocket {
        &self.nodes[key.node].sockets[&key.conn]
    }

    fn socket_mut(&mut self, key: SocketKey) -> &mut SimSocket {
        self.nodes[key.node]
            .sockets
            .get_mut(&key.conn)
            .expect("unknown simulated socket")
    }

    // ── Checks ──────────────────────────────────────────────────────────

    /// Every pair shares exactly one admitted socket, linked end to end,
    /// and nothing else is open.
    pub fn assert_full_mesh(&self) {
        let n = self.nodes.len();
        for a in 0..n {
            for b in (a + 1)..n {
                self.assert_linked(a, b);
            }
            let node = &self.nodes[a];
            assert_eq!(node.open_sockets(), n - 1, "node {a} holds extra sockets");
            assert_eq!(node.state.socket_count(), n - 1, "node {a} tracks extra sockets");
        }
    }

    /// `a` and `b` are admitted to each other over the two ends of one socket.
    pub fn assert_linked(&self, a: usize, b: usize) {
        let ca = self.nodes[a]
            .state
            .connection_of(&self.id(b))
            .unwrap_or_else(|| panic!("node {a} has no connection to node {b}"));
        let cb = self.nodes[b]
            .state
            .connection_of(&self.id(a))
            .unwrap_or_else(|| panic!("node {b} has no connection to node {a}"));
        let end_a = self.socket(SocketKey { node: a, conn: ca });
        let end_b = self.socket(SocketKey { node: b, conn: cb });
        assert!(end_a.open && end_a.promoted, "node {a} end is not live");
        assert!(end_b.open && end_b.promoted, "node {b} end is not live");
        assert_eq!(end_a.remote, Some(SocketKey { node: b, conn: cb }));
    }

    /// Connection ids node `a` has ever admitted for `b`.
    pub fn admitted(&self, a: usize, b: usize) -> HashSet<ConnId> {
        let id = self.id(b);
        self.nodes[a]
            .log
            .iter()
            .filter_map(|e| match e {
                MeshEffect::Promote { conn, peer } if *peer == id => Some(*conn),
                _ => None,
            })
            .collect()
    }

    pub fn reconnect_retries(&self, a: usize, b: usize) -> Vec<u32> {
        let id = self.id(b);
        self.nodes[a]
            .log
            .iter()
            .filter_map(|e| match e {
                MeshEffect::Reconnecting { peer, retries, .. } if *peer == id => Some(*retries),
                _ => None,
            })
            .collect()
    }

    pub fn peer_state(&self, a: usize, b: usize) -> Option<PeerState> {
        self.nodes[a]
            .state
            .registry()
            .get(&self.id(b))
            .map(|p| p.state().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "10.0.0.1:9000";
    const B: &str = "10.0.0.2:9000";
    const C: &str = "10.0.0.3:9000";

    #[test]
    fn simultaneous_add_fifo() {
        let mut net = SimNet::new(&[A, B], None);
        net.add_all();
        net.run();
        net.assert_full_mesh();
    }

    #[test]
    fn simultaneous_add_any_interleaving() {
        for seed in 0..500 {
            let mut net = SimNet::new(&[A, B], Some(seed));
            net.add_all();
            net.run();
            net.assert_full_mesh();
            assert_eq!(net.pending_timers(), 0, "seed {seed}");
        }
    }

    #[test]
    fn simultaneous_add_settles_without_retries() {
        for seed in 0..500 {
            let mut net = SimNet::new(&[A, B], Some(seed));
            net.add_all();
            net.settle();
            net.assert_full_mesh();
            assert!(net.reconnect_retries(0, 1).is_empty(), "seed {seed}");
            assert!(net.reconnect_retries(1, 0).is_empty(), "seed {seed}");
            assert_eq!(net.pending_timers(), 0, "seed {seed}");
        }
    }

    #[test]
    fn three_nodes_settle_without_retries() {
        for seed in 0..200 {
            let mut net = SimNet::new(&[A, B, C], Some(seed));
            net.add_all();
            net.settle();
            net.assert_full_mesh();
            for a in 0..3 {
                for b in 0..3 {
                    if a != b {
                        assert!(net.reconnect_retries(a, b).is_empty(), "seed {seed}");
                    }
                }
            }
        }
    }

    #[test]
    fn three_nodes_any_interleaving() {
        for seed in 0..200 {
            let mut net = SimNet::new(&[A, B, C], Some(seed));
            net.add_all();
            net.run();
            net.assert_full_mesh();
        }
    }

    #[test]
    fn one_sided_add_connects_both_ends() {
        for (dialer, listener) in [(0, 1), (1, 0)] {
            let mut net = SimNet::new(&[A, B], Some(7));
            net.add(dialer, listener);
            net.run();
            net.assert_full_mesh();
            assert_eq!(net.peer_state(listener, dialer), Some(PeerState::Inbound));
            assert!(matches!(
                net.peer_state(dialer, listener),
                Some(PeerState::Desired(_))
            ));
        }
    }

    #[test]
    fn severed_link_heals() {
        for seed in 0..100 {
            let mut net = SimNet::new(&[A, B], Some(seed));
            net.add_all();
            net.run();
            net.clear_logs();

            net.sever(0, 1);
            net.settle();
            assert_eq!(net.reconnect_retries(0, 1), vec![1]);
            assert_eq!(net.reconnect_retries(1, 0), vec![1]);

            net.run();
            net.assert_full_mesh();
            assert!(!net.admitted(0, 1).is_empty());
        }
    }

    #[test]
    fn inbound_only_peer_is_not_redialled() {
        let mut net = SimNet::new(&[A, B], None);
        net.add(0, 1);
        net.run();
        net.sever(1, 0);
        net.settle();

        assert!(net.reconnect_retries(1, 0).is_empty());
        assert_eq!(net.peer_state(1, 0), None);
        assert_eq!(net.reconnect_retries(0, 1), vec![1]);

        net.run();
        net.assert_full_mesh();
    }

    #[test]
    fn remove_then_add_uses_fresh_socket() {
        let mut net = SimNet::new(&[A, B], Some(3));
        net.add_all();
        net.run();
        let before = net.admitted(0, 1);

        net.remove(0, 1);
        net.add(0, 1);
        net.run();
        net.assert_full_mesh();

        let after = net.admitted(0, 1);
        assert!(after.len() > before.len());
    }

    #[test]
    fn removed_peer_stays_gone() {
        let mut net = SimNet::new(&[A, B], None);
        net.add(0, 1);
        net.run();
        net.remove(0, 1);
        net.run();

        assert_eq!(net.peer_state(0, 1), None);
        assert_eq!(net.peer_state(1, 0), None);
        assert_eq!(net.node(0).state.socket_count(), 0);
        assert!(net.reconnect_retries(0, 1).is_empty());
    }

    #[test]
    fn unreachable_peer_backs_off() {
        let mut net = SimNet::new(&[A, B], None);
        net.destroy(1);
        net.add(0, 1);
        for _ in 0..3 {
            net.settle();
            net.fire_timers();
        }
        net.settle();
        assert_eq!(net.reconnect_retries(0, 1), vec![1, 2, 3, 4]);
    }

    #[test]
    fn destroyed_node_drops_everyone() {
        let mut net = SimNet::new(&[A, B, C], Some(11));
        net.add_all();
        net.run();
        net.clear_logs();

        net.destroy(0);
        net.settle();
        assert!(net.node(0).state.registry().is_empty());
        assert_eq!(net.node(0).state.socket_count(), 0);
        // The others lost node 0 and keep trying.
        assert_eq!(net.reconnect_retries(1, 0), vec![1]);
        assert_eq!(net.reconnect_retries(2, 0), vec![1]);
        net.assert_linked(1, 2);
    }
}
