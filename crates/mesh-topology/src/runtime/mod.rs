/// Mesh runtime: the admission state machine wired to live sockets.
///
/// The runtime owns the listener, every socket driver and every reconnect
/// timer. It exposes a channel-based API so the application never touches
/// the handshake or the registry directly.
mod effect;
mod executor;
mod r#loop;
mod socket;
mod state;

#[cfg(test)]
mod harness;

use std::net::SocketAddr;
use std::time::Duration;

use mesh_transport::{resolve_local_identity, PeerId, TransportConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::connection::{ConnId, Connection, InboundFrame};
use crate::reconnect::ReconnectPolicy;
use crate::TopologyError;

pub use effect::MeshEffect;
pub use state::MeshState;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Local identity: `host:port`, a bare port (expanded with the local
    /// network address), or empty for a node that only dials out.
    pub identity: String,
    /// Peers to add right after startup.
    pub peers: Vec<PeerId>,
    pub transport: TransportConfig,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the event channel.
    ///
    /// Events are pushed with `try_send` so a slow consumer never stalls the
    /// mesh. When the channel is full, `Connected`, `Reconnecting` and
    /// `Disconnected` events are dropped with a warning. The events that do
    /// arrive keep their per-peer order. Size this for the largest burst
    /// expected between reads.
    pub event_buffer: usize,
    /// Capacity of the inbound frame channel.
    pub frame_buffer: usize,
    /// Frames queued per connection before `send` waits.
    pub outbound_buffer: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            peers: Vec::new(),
            transport: TransportConfig::new(),
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
            frame_buffer: 1024,
            outbound_buffer: 64,
        }
    }
}

impl TopologyConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn peer(mut self, id: impl Into<PeerId>) -> Self {
        self.peers.push(id.into());
        self
    }

    pub fn peers<I, P>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.peers.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the mesh event loop.
pub(crate) enum TopologyCommand {
    /// Bind the listener, replacing any previous one.
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, TopologyError>>,
    },
    /// Add or refresh a desired peer.
    Add { id: PeerId },
    /// Stop maintaining a peer.
    Remove { id: PeerId },
    /// Query: the admitted connection to a peer.
    Peer {
        id: PeerId,
        reply: oneshot::Sender<Option<Connection>>,
    },
    /// Query: every admitted connection.
    Connections {
        reply: oneshot::Sender<Vec<Connection>>,
    },
    /// Stop listening and remove every peer; the loop keeps running.
    Destroy { reply: oneshot::Sender<()> },
    /// Destroy, then stop the loop.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Mesh events the application may want to observe.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// A peer was admitted on a new socket.
    Connected { peer: PeerId, connection: Connection },
    /// A desired peer was lost; a redial is scheduled.
    Reconnecting {
        peer: PeerId,
        retries: u32,
        delay: Duration,
    },
    /// An admitted connection closed.
    Disconnected { peer: PeerId, conn: ConnId },
}

// ── TopologyHandle (app-facing API) ──────────────────────────────────

/// Handle to a running mesh node.
///
/// Cheap to clone. Dropping every clone shuts the node down.
#[derive(Clone)]
pub struct TopologyHandle {
    cmd_tx: mpsc::Sender<TopologyCommand>,
    local_id: PeerId,
}

impl TopologyHandle {
    /// This node's identity.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Listen on `port` of the configured bind host. Port 0 picks a free port.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, TopologyError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(TopologyCommand::Listen { port, reply: tx })
            .await
            .map_err(|_| TopologyError::Shutdown)?;
        rx.await.map_err(|_| TopologyError::Shutdown)?
    }

    /// Keep a connection to `id`, redialling it whenever it is lost.
    ///
    /// Idempotent. Adding our own identity does nothing.
    pub async fn add(&self, id: impl Into<PeerId>) -> Result<(), TopologyError> {
        let id = id.into();
        if id != self.local_id && id.dial_target().is_err() {
            return Err(TopologyError::InvalidIdentity(id.to_string()));
        }
        self.cmd_tx
            .send(TopologyCommand::Add { id })
            .await
            .map_err(|_| TopologyError::Shutdown)
    }

    /// Stop maintaining `id` and close its connection. Unknown peers are ignored.
    pub async fn remove(&self, id: impl Into<PeerId>) -> Result<(), TopologyError> {
        self.cmd_tx
            .send(TopologyCommand::Remove { id: id.into() })
            .await
            .map_err(|_| TopologyError::Shutdown)
    }

    /// The admitted connection to `id`, if there is one right now.
    pub async fn peer(&self, id: impl Into<PeerId>) -> Option<Connection> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(TopologyCommand::Peer {
                id: id.into(),
                reply: tx,
            })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Every admitted connection.
    pub async fn connections(&self) -> Vec<Connection> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(TopologyCommand::Connections { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Stop listening and remove every peer. The node stays usable.
    pub async fn destroy(&self) -> Result<(), TopologyError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(TopologyCommand::Destroy { reply: tx })
            .await
            .map_err(|_| TopologyError::Shutdown)?;
        rx.await.map_err(|_| TopologyError::Shutdown)
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(TopologyCommand::Shutdown).await;
    }
}

// ── TopologyChannels ─────────────────────────────────────────────────

/// Channels returned to the application when the node starts.
pub struct TopologyChannels {
    /// Handle to send commands to the node.
    pub handle: TopologyHandle,
    /// Connected / Reconnecting / Disconnected notifications.
    pub events: mpsc::Receiver<TopologyEvent>,
    /// Frames received on admitted connections.
    pub frames: mpsc::Receiver<InboundFrame>,
}

// ── Topology ─────────────────────────────────────────────────────────

/// A mesh node. Spawn it and talk to it over channels.
pub struct Topology;

impl Topology {
    /// Create and start a mesh node.
    ///
    /// Resolves the local identity, spawns the event loop, listens on the
    /// identity's port (unless the identity is empty) and adds the
    /// configured peers.
    pub async fn spawn(config: TopologyConfig) -> Result<TopologyChannels, TopologyError> {
        let local_id = resolve_local_identity(&config.identity);
        let listen_port = if local_id.is_empty() {
            None
        } else {
            let target = local_id
                .dial_target()
                .map_err(|_| TopologyError::InvalidIdentity(local_id.to_string()))?;
            Some(target.port)
        };

        // Command channel (app → runtime)
        let (cmd_tx, cmd_rx) = mpsc::channel::<TopologyCommand>(64);

        // Event channels (runtime → app)
        let (event_tx, event_rx) = mpsc::channel::<TopologyEvent>(config.event_buffer);
        let (frame_tx, frame_rx) = mpsc::channel::<InboundFrame>(config.frame_buffer);

        // Socket reports and timers (drivers → runtime)
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let state = MeshState::new(local_id.clone(), config.reconnect.clone());
        let executor = executor::Executor::new(
            &local_id,
            config.transport.clone(),
            config.outbound_buffer,
            input_tx,
            event_tx,
            frame_tx,
        );
        tokio::spawn(r#loop::mesh_loop(state, executor, cmd_rx, input_rx));

        let handle = TopologyHandle {
            cmd_tx,
            local_id: local_id.clone(),
        };
        info!("mesh: node {local_id} starting");
        if let Some(port) = listen_port {
            handle.listen(port).await?;
        }
        for peer in config.peers {
            handle.add(peer).await?;
        }

        Ok(TopologyChannels {
            handle,
            events: event_rx,
            frames: frame_rx,
        })
    }
}
