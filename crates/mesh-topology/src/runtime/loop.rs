/// The mesh event loop.
///
/// A single async task that owns the `MeshState` and multiplexes over
/// application commands, socket reports, accepted sockets, and timers.
use tokio::sync::mpsc;
use tracing::debug;

use super::executor::{Executor, Input};
use super::socket::SocketEvent;
use super::state::MeshState;
use super::TopologyCommand;

/// Main event loop. Runs until shutdown or until every handle is dropped.
pub(super) async fn mesh_loop(
    mut state: MeshState,
    mut executor: Executor,
    mut cmd_rx: mpsc::Receiver<TopologyCommand>,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
) {
    loop {
        tokio::select! {
            // ── 1. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("mesh: all handles dropped, stopping");
                    executor.execute(state.handle_destroy());
                    break;
                };
                match cmd {
                    TopologyCommand::Listen { port, reply } => {
                        let _ = reply.send(executor.listen(port).await);
                    }
                    TopologyCommand::Add { id } => {
                        executor.execute(state.handle_add(id));
                    }
                    TopologyCommand::Remove { id } => {
                        executor.execute(state.handle_remove(&id));
                    }
                    TopologyCommand::Peer { id, reply } => {
                        let connection = state
                            .connection_of(&id)
                            .and_then(|conn| executor.connection(conn));
                        let _ = reply.send(connection);
                    }
                    TopologyCommand::Connections { reply } => {
                        let connections = state
                            .registry()
                            .live_connections()
                            .into_iter()
                            .filter_map(|(_, conn)| executor.connection(conn))
                            .collect();
                        let _ = reply.send(connections);
                    }
                    TopologyCommand::Destroy { reply } => {
                        executor.execute(state.handle_destroy());
                        let _ = reply.send(());
                    }
                    TopologyCommand::Shutdown => {
                        executor.execute(state.handle_destroy());
                        break;
                    }
                }
            }

            // ── 2. Sockets and timers ───────────────────────────
            Some(input) = input_rx.recv() => {
                match input {
                    Input::Socket(event) => {
                        executor.observe(&event);
                        let effects = match event {
                            SocketEvent::Connected { conn, .. } => state.handle_connected(conn),
                            SocketEvent::Frame { conn, payload } => state.handle_frame(conn, &payload),
                            SocketEvent::Closed { conn, reason } => {
                                debug!("mesh: {conn} closed ({reason})");
                                state.handle_closed(conn, reason.closed_by())
                            }
                        };
                        executor.execute(effects);
                    }
                    Input::Accepted { stream, endpoints } => {
                        let (conn, effects) = state.handle_accepted();
                        executor.spawn_accepted(conn, stream, endpoints);
                        executor.execute(effects);
                    }
                    Input::ReconnectDue { peer, ticket } => {
                        executor.reconnect_fired(ticket);
                        executor.execute(state.handle_reconnect_due(&peer, ticket));
                    }
                }
            }
        }
    }

    executor.shutdown();
}
