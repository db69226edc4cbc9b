//! Per-socket driver task.
//!
//! Runs the handshake commands issued by the state machine one at a time,
//! under a single deadline, then shuttles frames between the socket and
//! the application until either side closes it. Every exit path ends with
//! exactly one `Closed` report.

use std::fmt;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mesh_transport::{
    connect, read_frame, write_frame, DialTarget, Endpoints, FramedStream, PeerId,
    TransportConfig, TransportError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::admission::ClosedBy;
use crate::connection::{ConnId, InboundFrame};

use super::executor::Input;

/// How a socket comes to exist.
pub(crate) enum Origin {
    Accepted(FramedStream),
    Dial(DialTarget),
}

/// Handshake instructions, processed in order.
pub(crate) enum SocketCommand {
    Send(Bytes),
    ReadFrame,
    Promote(Promotion),
}

/// What an admitted socket needs to serve the application.
pub(crate) struct Promotion {
    pub peer: PeerId,
    pub outbound: mpsc::Receiver<Bytes>,
    pub frames: mpsc::Sender<InboundFrame>,
}

/// Reports from a driver to the event loop.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Connected { conn: ConnId, endpoints: Endpoints },
    Frame { conn: ConnId, payload: Bytes },
    Closed { conn: ConnId, reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Destroyed,
    HandshakeTimeout,
    Eof,
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Destroyed => f.write_str("destroyed"),
            CloseReason::HandshakeTimeout => f.write_str("handshake timed out"),
            CloseReason::Eof => f.write_str("closed by peer"),
            CloseReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl CloseReason {
    pub fn closed_by(&self) -> ClosedBy {
        match self {
            CloseReason::Eof => ClosedBy::Remote,
            _ => ClosedBy::Local,
        }
    }
}

impl From<TransportError> for CloseReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => CloseReason::Eof,
            other => CloseReason::Failed(other.to_string()),
        }
    }
}

/// Drive one socket from birth to its `Closed` report.
pub(crate) async fn drive(
    conn: ConnId,
    origin: Origin,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    input: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
    config: TransportConfig,
) {
    let reason = tokio::select! {
        _ = cancel.cancelled() => CloseReason::Destroyed,
        reason = run(conn, origin, &mut commands, &input, &config) => reason,
    };
    // Marks every Connection handle for this socket closed.
    cancel.cancel();
    let _ = input.send(Input::Socket(SocketEvent::Closed { conn, reason }));
}

async fn run(
    conn: ConnId,
    origin: Origin,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    input: &mpsc::UnboundedSender<Input>,
    config: &TransportConfig,
) -> CloseReason {
    let handshake = handshake(conn, origin, commands, input, config);
    match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Err(_) => CloseReason::HandshakeTimeout,
        Ok(Err(reason)) => reason,
        Ok(Ok((framed, promotion))) => serve(conn, framed, promotion).await,
    }
}

async fn handshake(
    conn: ConnId,
    origin: Origin,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    input: &mpsc::UnboundedSender<Input>,
    config: &TransportConfig,
) -> Result<(FramedStream, Promotion), CloseReason> {
    let mut framed = match origin {
        Origin::Accepted(framed) => framed,
        Origin::Dial(target) => {
            let (framed, endpoints) = connect(&target, config).await?;
            let _ = input.send(Input::Socket(SocketEvent::Connected { conn, endpoints }));
            framed
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            SocketCommand::Send(payload) => write_frame(&mut framed, payload).await?,
            SocketCommand::ReadFrame => {
                let payload = read_frame(&mut framed).await?;
                let _ = input.send(Input::Socket(SocketEvent::Frame { conn, payload }));
            }
            SocketCommand::Promote(promotion) => return Ok((framed, promotion)),
        }
    }
    Err(CloseReason::Destroyed)
}

async fn serve(conn: ConnId, mut framed: FramedStream, promotion: Promotion) -> CloseReason {
    let Promotion {
        peer,
        mut outbound,
        frames,
    } = promotion;

    loop {
        tokio::select! {
            incoming = framed.next() => match incoming {
                Some(Ok(payload)) => {
                    let frame = InboundFrame {
                        from: peer.clone(),
                        conn,
                        payload: payload.freeze(),
                    };
                    if frames.send(frame).await.is_err() {
                        debug!("socket: frame receiver dropped, discarding frame from {peer}");
                    }
                }
                Some(Err(e)) => return CloseReason::Failed(e.to_string()),
                None => return CloseReason::Eof,
            },
            Some(payload) = outbound.recv() => {
                if let Err(e) = framed.send(payload).await {
                    return CloseReason::Failed(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_from_transport_error() {
        assert_eq!(CloseReason::from(TransportError::Closed), CloseReason::Eof);
        assert_eq!(
            CloseReason::from(TransportError::InvalidHello("bad".into())),
            CloseReason::Failed("invalid hello: bad".into())
        );
    }

    #[test]
    fn only_eof_counts_as_remote_close() {
        assert_eq!(CloseReason::Eof.closed_by(), ClosedBy::Remote);
        assert_eq!(CloseReason::HandshakeTimeout.closed_by(), ClosedBy::Local);
        assert_eq!(CloseReason::Destroyed.closed_by(), ClosedBy::Local);
        assert_eq!(CloseReason::Failed("reset".into()).closed_by(), ClosedBy::Local);
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::HandshakeTimeout.to_string(), "handshake timed out");
        assert_eq!(CloseReason::Eof.to_string(), "closed by peer");
    }
}
