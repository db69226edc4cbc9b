//! Mesh transport layer.
//!
//! Plain TCP connectivity for the mesh topology: peer identities, dial
//! targets, listeners, and the length-prefixed frame codec carried by every
//! socket (handshake frames first, application frames after admission).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mesh_transport::{connect, decode_hello, read_frame, write_hello, Listener, PeerId, TransportConfig};
//!
//! # async fn example() -> Result<(), mesh_transport::TransportError> {
//! let config = TransportConfig::new().bind_host("127.0.0.1");
//! let listener = Listener::bind(&config, 0).await?;
//! let port = listener.local_addr()?.port();
//!
//! let me: PeerId = format!("127.0.0.1:{}", port + 1).into();
//! let target = PeerId::from(format!("127.0.0.1:{port}")).dial_target()?;
//! let (mut dialed, _) = connect(&target, &config).await?;
//! write_hello(&mut dialed, &me).await?;
//!
//! let (mut accepted, endpoints) = listener.accept().await?;
//! let hello = decode_hello(&read_frame(&mut accepted).await?)?;
//! println!("{hello} connected from {}", endpoints.remote);
//! # Ok(())
//! # }
//! ```

mod addr;
mod config;
mod error;
mod framing;
mod listener;

pub use addr::{local_network_address, resolve_local_identity, DialTarget};
pub use config::TransportConfig;
pub use error::TransportError;
pub use framing::{
    connect, decode_hello, encode_hello, frame_codec, read_frame, write_frame, write_hello,
    Endpoints, FramedStream,
};
pub use listener::Listener;

use std::fmt;
use std::str::FromStr;

/// Mesh identity: an opaque string, normally `host:port`.
///
/// Identities are totally ordered by byte-wise comparison; the order
/// decides which side of a simultaneous dial keeps its socket.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The empty identity belongs to a node that does not listen.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split the identity into the address to dial.
    pub fn dial_target(&self) -> Result<DialTarget, TransportError> {
        DialTarget::parse(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&PeerId> for PeerId {
    fn from(id: &PeerId) -> Self {
        id.clone()
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}
