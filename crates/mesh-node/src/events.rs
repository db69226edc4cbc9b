use chrono::SecondsFormat;
use mesh_topology::{Connection, InboundFrame, PeerId, TopologyEvent};
use serde::Serialize;

/// RFC 3339 timestamp, millisecond precision.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub id: String,
    pub peers: Vec<String>,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(id: &PeerId, peers: &[String]) -> Self {
        Self {
            event: "started",
            id: id.to_string(),
            peers: peers.to_vec(),
            timestamp: now_iso(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStopped {
    pub event: &'static str,
    pub frames_received: u64,
    pub elapsed_s: f64,
    pub timestamp: String,
}

impl EventStopped {
    pub fn new(frames_received: u64, elapsed_s: f64) -> Self {
        Self {
            event: "stopped",
            frames_received,
            elapsed_s,
            timestamp: now_iso(),
        }
    }
}

// ── Mesh lifecycle ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventConnected {
    pub event: &'static str,
    pub peer: String,
    pub conn: String,
    pub local: String,
    pub remote: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct EventReconnecting {
    pub event: &'static str,
    pub peer: String,
    pub retries: u32,
    pub delay_ms: u64,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct EventDisconnected {
    pub event: &'static str,
    pub peer: String,
    pub conn: String,
    pub timestamp: String,
}

impl EventConnected {
    pub fn new(peer: &PeerId, connection: &Connection) -> Self {
        Self {
            event: "connected",
            peer: peer.to_string(),
            conn: connection.id().to_string(),
            local: connection.local_addr().to_string(),
            remote: connection.remote_addr().to_string(),
            timestamp: now_iso(),
        }
    }
}

/// One JSONL record per topology event.
#[derive(Serialize)]
#[serde(untagged)]
pub enum Lifecycle {
    Connected(EventConnected),
    Reconnecting(EventReconnecting),
    Disconnected(EventDisconnected),
}

impl From<&TopologyEvent> for Lifecycle {
    fn from(event: &TopologyEvent) -> Self {
        match event {
            TopologyEvent::Connected { peer, connection } => {
                Lifecycle::Connected(EventConnected::new(peer, connection))
            }
            TopologyEvent::Reconnecting {
                peer,
                retries,
                delay,
            } => Lifecycle::Reconnecting(EventReconnecting {
                event: "reconnecting",
                peer: peer.to_string(),
                retries: *retries,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                timestamp: now_iso(),
            }),
            TopologyEvent::Disconnected { peer, conn } => {
                Lifecycle::Disconnected(EventDisconnected {
                    event: "disconnected",
                    peer: peer.to_string(),
                    conn: conn.to_string(),
                    timestamp: now_iso(),
                })
            }
        }
    }
}

// ── Frames ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventFrame {
    pub event: &'static str,
    pub from: String,
    pub conn: String,
    pub len: usize,
    /// Payload as text, lossy for non-UTF-8 bytes.
    pub text: String,
    pub timestamp: String,
}

impl EventFrame {
    pub fn new(frame: &InboundFrame) -> Self {
        Self {
            event: "frame",
            from: frame.from.to_string(),
            conn: frame.conn.to_string(),
            len: frame.payload.len(),
            text: String::from_utf8_lossy(&frame.payload).into_owned(),
            timestamp: now_iso(),
        }
    }
}
