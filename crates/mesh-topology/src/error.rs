use mesh_transport::PeerId;

use crate::connection::ConnId;

/// Topology-level errors.
///
/// Wraps transport errors and adds the failures of the application-facing API.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("transport error: {0}")]
    Transport(#[from] mesh_transport::TransportError),

    #[error("invalid peer identity {0:?}: expected host:port")]
    InvalidIdentity(String),

    #[error("connection {conn} to {peer} is closed")]
    ConnectionClosed { peer: PeerId, conn: ConnId },

    #[error("topology is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_identity() {
        let err = TopologyError::InvalidIdentity("nohost".into());
        assert_eq!(
            err.to_string(),
            "invalid peer identity \"nohost\": expected host:port"
        );
    }

    #[test]
    fn test_display_connection_closed() {
        let err = TopologyError::ConnectionClosed {
            peer: PeerId::from("10.0.0.1:9000"),
            conn: ConnId::new(7),
        };
        assert_eq!(err.to_string(), "connection conn#7 to 10.0.0.1:9000 is closed");
    }

    #[test]
    fn test_display_shutdown() {
        assert_eq!(TopologyError::Shutdown.to_string(), "topology is shut down");
    }

    #[test]
    fn test_transport_conversion() {
        let err: TopologyError = mesh_transport::TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: connection closed by peer");
    }
}
