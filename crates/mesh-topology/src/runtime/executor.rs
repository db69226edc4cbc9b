//! Effect executor, the only place that touches I/O.
//!
//! Takes the `MeshEffect`s produced by `MeshState` and carries them out:
//! - Connect -> spawn a socket driver that dials
//! - SendHello / ReadFrame / Promote -> queue a command on the driver
//! - Destroy -> cancel the driver
//! - ScheduleReconnect / CancelReconnect -> arm or disarm a timer
//! - Reconnecting / Disconnected -> event_tx.try_send()
//! - StopListening -> abort the accept task

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use mesh_transport::{encode_hello, Endpoints, FramedStream, Listener, PeerId, TransportConfig};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, Connection, InboundFrame};
use crate::reconnect::{ReconnectScheduler, ReconnectTicket};
use crate::registry::PeerRef;
use crate::TopologyError;

use super::effect::MeshEffect;
use super::socket::{self, Origin, Promotion, SocketCommand, SocketEvent};
use super::TopologyEvent;

/// Everything the event loop reacts to besides application commands.
pub(crate) enum Input {
    Socket(SocketEvent),
    Accepted {
        stream: FramedStream,
        endpoints: Endpoints,
    },
    ReconnectDue {
        peer: PeerRef,
        ticket: ReconnectTicket,
    },
}

struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
    cancel: CancellationToken,
    endpoints: Option<Endpoints>,
}

struct ActiveListener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

pub(crate) struct Executor {
    hello: Bytes,
    transport: TransportConfig,
    outbound_buffer: usize,
    input_tx: mpsc::UnboundedSender<Input>,
    event_tx: mpsc::Sender<TopologyEvent>,
    frame_tx: mpsc::Sender<InboundFrame>,
    sockets: HashMap<ConnId, SocketHandle>,
    connections: HashMap<ConnId, Connection>,
    scheduler: ReconnectScheduler,
    listener: Option<ActiveListener>,
}

impl Executor {
    pub fn new(
        local_id: &PeerId,
        transport: TransportConfig,
        outbound_buffer: usize,
        input_tx: mpsc::UnboundedSender<Input>,
        event_tx: mpsc::Sender<TopologyEvent>,
        frame_tx: mpsc::Sender<InboundFrame>,
    ) -> Self {
        Self {
            hello: encode_hello(local_id),
            transport,
            outbound_buffer,
            input_tx,
            event_tx,
            frame_tx,
            sockets: HashMap::new(),
            connections: HashMap::new(),
            scheduler: ReconnectScheduler::new(),
            listener: None,
        }
    }

    /// Execute effects in order.
    pub fn execute(&mut self, effects: Vec<MeshEffect>) {
        for effect in effects {
            match effect {
                MeshEffect::Connect { conn, target } => {
                    self.spawn_socket(conn, Origin::Dial(target), None);
                }
                MeshEffect::SendHello { conn } => {
                    self.command(conn, SocketCommand::Send(self.hello.clone()));
                }
                MeshEffect::ReadFrame { conn } => {
                    self.command(conn, SocketCommand::ReadFrame);
                }
                MeshEffect::Promote { conn, peer } => self.promote(conn, peer),
                MeshEffect::Destroy { conn } => {
                    if let Some(socket) = self.sockets.get(&conn) {
                        socket.cancel.cancel();
                    }
                }
                MeshEffect::ScheduleReconnect {
                    peer,
                    ticket,
                    delay,
                } => {
                    let input_tx = self.input_tx.clone();
                    self.scheduler.schedule(ticket, delay, move || {
                        let _ = input_tx.send(Input::ReconnectDue { peer, ticket });
                    });
                }
                MeshEffect::CancelReconnect { ticket } => self.scheduler.cancel(ticket),
                MeshEffect::Reconnecting {
                    peer,
                    retries,
                    delay,
                } => self.emit(TopologyEvent::Reconnecting {
                    peer,
                    retries,
                    delay,
                }),
                MeshEffect::Disconnected { peer, conn } => {
                    self.emit(TopologyEvent::Disconnected { peer, conn })
                }
                MeshEffect::StopListening => self.stop_listening(),
            }
        }
    }

    /// Start driving a socket handed over by the listener.
    pub fn spawn_accepted(&mut self, conn: ConnId, stream: FramedStream, endpoints: Endpoints) {
        self.spawn_socket(conn, Origin::Accepted(stream), Some(endpoints));
    }

    /// Bookkeeping for a socket report, before the state machine sees it.
    pub fn observe(&mut self, event: &SocketEvent) {
        match event {
            SocketEvent::Connected { conn, endpoints } => {
                if let Some(socket) = self.sockets.get_mut(conn) {
                    socket.endpoints = Some(*endpoints);
                }
            }
            SocketEvent::Closed { conn, .. } => {
                self.sockets.remove(conn);
                self.connections.remove(conn);
            }
            SocketEvent::Frame { .. } => {}
        }
    }

    pub fn reconnect_fired(&mut self, ticket: ReconnectTicket) {
        self.scheduler.fired(ticket);
    }

    pub fn connection(&self, conn: ConnId) -> Option<Connection> {
        self.connections.get(&conn).cloned()
    }

    /// Bind the listener, replacing any previous one.
    pub async fn listen(&mut self, port: u16) -> Result<SocketAddr, TopologyError> {
        self.stop_listening();
        let listener = Listener::bind(&self.transport, port).await?;
        let addr = listener.local_addr()?;
        let input_tx = self.input_tx.clone();
        let task = tokio::spawn(accept_loop(listener, input_tx));
        info!("mesh: listening on {addr}");
        self.listener = Some(ActiveListener { addr, task });
        Ok(addr)
    }

    /// Tear down every socket, timer and the listener.
    pub fn shutdown(&mut self) {
        self.stop_listening();
        debug!(
            "mesh: shutting down ({} socket(s), {} timer(s))",
            self.sockets.len(),
            self.scheduler.len()
        );
        for socket in self.sockets.values() {
            socket.cancel.cancel();
        }
        self.scheduler.cancel_all();
    }

    fn spawn_socket(&mut self, conn: ConnId, origin: Origin, endpoints: Option<Endpoints>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(socket::drive(
            conn,
            origin,
            command_rx,
            self.input_tx.clone(),
            cancel.clone(),
            self.transport.clone(),
        ));
        self.sockets.insert(
            conn,
            SocketHandle {
                commands,
                cancel,
                endpoints,
            },
        );
    }

    fn command(&self, conn: ConnId, command: SocketCommand) {
        if let Some(socket) = self.sockets.get(&conn) {
            let _ = socket.commands.send(command);
        }
    }

    fn promote(&mut self, conn: ConnId, peer: PeerId) {
        let Some(socket) = self.sockets.get(&conn) else {
            return;
        };
        let Some(endpoints) = socket.endpoints else {
            warn!("mesh: {conn} admitted before its endpoints were known");
            socket.cancel.cancel();
            return;
        };
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_buffer);
        let connection = Connection::new(
            conn,
            peer.clone(),
            endpoints,
            outbound_tx,
            socket.cancel.clone(),
            self.transport.max_frame_size,
        );
        let _ = socket.commands.send(SocketCommand::Promote(Promotion {
            peer: peer.clone(),
            outbound: outbound_rx,
            frames: self.frame_tx.clone(),
        }));
        self.connections.insert(conn, connection.clone());
        self.emit(TopologyEvent::Connected { peer, connection });
    }

    fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            info!("mesh: stopped listening on {}", listener.addr);
        }
    }

    fn emit(&self, event: TopologyEvent) {
        // try_send: never block the loop on a slow consumer
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!("mesh: event channel full, dropping {event:?}");
            }
        }
    }
}

async fn accept_loop(listener: Listener, input_tx: mpsc::UnboundedSender<Input>) {
    loop {
        match listener.accept().await {
            Ok((stream, endpoints)) => {
                debug!("mesh: accepted {}", endpoints.remote);
                if input_tx.send(Input::Accepted { stream, endpoints }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("mesh: accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}
