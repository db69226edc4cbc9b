use std::time::Duration;

/// Default time a socket may spend in the handshake before it is destroyed.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Configuration shared by listeners and dialers.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use mesh_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::new()
///     .bind_host("127.0.0.1")
///     .handshake_timeout(Duration::from_secs(5));
/// assert_eq!(config.bind_host, "127.0.0.1");
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interface the listener binds to.
    pub bind_host: String,
    /// Maximum frame size in bytes, both directions.
    pub max_frame_size: usize,
    /// Deadline for the whole identity exchange on one socket: connect,
    /// hello and reply together. It is one fixed deadline from the moment the
    /// socket exists, not an idle timer reset by each read or write. A socket
    /// still handshaking when it expires is destroyed. Admitted sockets have
    /// no timeout.
    pub handshake_timeout: Duration,
    /// Optional deadline for the TCP connect itself. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    ///
    /// If the `MESH_BIND_HOST` environment variable is set, it is used as the
    /// listen interface instead of `0.0.0.0`. Override with [`.bind_host()`](Self::bind_host).
    pub fn new() -> Self {
        let bind_host = std::env::var("MESH_BIND_HOST")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        Self {
            bind_host,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: None,
        }
    }

    /// Set the listen interface (default: `0.0.0.0`).
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set the maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the handshake deadline (default: 15 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bound the TCP connect.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}
