use crate::DialTarget;

/// Errors returned by the mesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} failed: {source}")]
    Connect {
        target: DialTarget,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} timed out")]
    ConnectTimeout { target: DialTarget },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid hello: {0}")]
    InvalidHello(String),

    #[error("invalid identity {0:?}: expected host:port")]
    InvalidIdentity(String),

    #[error("connection closed by peer")]
    Closed,
}
