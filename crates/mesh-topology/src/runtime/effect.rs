use std::time::Duration;

use mesh_transport::{DialTarget, PeerId};

use crate::connection::ConnId;
use crate::reconnect::ReconnectTicket;
use crate::registry::PeerRef;

/// Intent produced by the pure logic of [`MeshState`](super::MeshState).
///
/// Every `handle_*` method returns `Vec<MeshEffect>`; the event loop then
/// carries them out through the executor, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEffect {
    /// Open an outbound socket to `target`, known as `conn` from now on.
    Connect { conn: ConnId, target: DialTarget },

    /// Write the local identity as one frame.
    SendHello { conn: ConnId },

    /// Read exactly one frame and report it back.
    ReadFrame { conn: ConnId },

    /// Handshake done: disarm the deadline and hand the socket to the application.
    Promote { conn: ConnId, peer: PeerId },

    /// Tear the socket down. A close report follows.
    Destroy { conn: ConnId },

    /// Arm a reconnect timer.
    ScheduleReconnect {
        peer: PeerRef,
        ticket: ReconnectTicket,
        delay: Duration,
    },

    /// Disarm a reconnect timer.
    CancelReconnect { ticket: ReconnectTicket },

    /// Tell the application a redial is scheduled.
    Reconnecting {
        peer: PeerId,
        retries: u32,
        delay: Duration,
    },

    /// Tell the application an admitted connection closed.
    Disconnected { peer: PeerId, conn: ConnId },

    /// Close the listener.
    StopListening,
}
