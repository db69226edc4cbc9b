//! Length-prefixed framing over TCP.
//!
//! Every frame is a 4-byte big-endian length followed by the payload. The
//! first frame each side writes on a socket is its hello: the sender's
//! identity as UTF-8.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{DialTarget, PeerId, TransportConfig, TransportError};

/// A TCP stream speaking the mesh frame codec.
pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Both ends of a socket as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// The codec used on every mesh socket.
pub fn frame_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_size)
        .new_codec()
}

pub(crate) fn framed(
    stream: TcpStream,
    config: &TransportConfig,
) -> Result<(FramedStream, Endpoints), TransportError> {
    stream.set_nodelay(true)?;
    let endpoints = Endpoints {
        local: stream.local_addr()?,
        remote: stream.peer_addr()?,
    };
    Ok((
        Framed::new(stream, frame_codec(config.max_frame_size)),
        endpoints,
    ))
}

/// Open a TCP connection to `target`.
pub async fn connect(
    target: &DialTarget,
    config: &TransportConfig,
) -> Result<(FramedStream, Endpoints), TransportError> {
    let attempt = TcpStream::connect((target.host.as_str(), target.port));
    let result = match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                target: target.clone(),
            })?,
        None => attempt.await,
    };
    let stream = result.map_err(|source| TransportError::Connect {
        target: target.clone(),
        source,
    })?;
    framed(stream, config)
}

/// Write one frame. Oversized payloads are rejected before touching the socket.
pub async fn write_frame(framed: &mut FramedStream, payload: Bytes) -> Result<(), TransportError> {
    let max = framed.codec().max_frame_length();
    if payload.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    framed.send(payload).await?;
    Ok(())
}

/// Read one frame. A clean EOF is [`TransportError::Closed`].
pub async fn read_frame(framed: &mut FramedStream) -> Result<Bytes, TransportError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame.freeze()),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransportError::Closed),
    }
}

/// Hello payload for `id`.
pub fn encode_hello(id: &PeerId) -> Bytes {
    Bytes::copy_from_slice(id.as_str().as_bytes())
}

/// Write the hello frame carrying `id`.
pub async fn write_hello(framed: &mut FramedStream, id: &PeerId) -> Result<(), TransportError> {
    write_frame(framed, encode_hello(id)).await
}

/// Decode a hello frame. The identity must be valid UTF-8.
pub fn decode_hello(frame: &[u8]) -> Result<PeerId, TransportError> {
    std::str::from_utf8(frame)
        .map(PeerId::from)
        .map_err(|e| TransportError::InvalidHello(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn hello_roundtrip() {
        let id = PeerId::from("127.0.0.1:9000");
        assert_eq!(decode_hello(&encode_hello(&id)).unwrap(), id);
    }

    #[test]
    fn hello_rejects_invalid_utf8() {
        let err = decode_hello(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, TransportError::InvalidHello(_)));
    }

    #[test]
    fn codec_writes_big_endian_length() {
        let mut codec = frame_codec(1024);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn codec_rejects_oversized_incoming_frame() {
        let mut codec = frame_codec(4);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 8, 1, 2, 3, 4, 5, 6, 7, 8][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn codec_waits_for_partial_frame() {
        let mut codec = frame_codec(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'e'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"llo");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
    }
}
