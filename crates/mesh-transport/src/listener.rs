use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::framing::{framed, Endpoints, FramedStream};
use crate::{TransportConfig, TransportError};

/// A bound TCP listener producing framed sockets.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    config: TransportConfig,
}

impl Listener {
    /// Bind `config.bind_host` on `port`. Port 0 picks a free port.
    pub async fn bind(config: &TransportConfig, port: u16) -> Result<Self, TransportError> {
        let addr = format!("{}:{port}", config.bind_host);
        let inner = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Wait for the next inbound socket.
    pub async fn accept(&self) -> Result<(FramedStream, Endpoints), TransportError> {
        let (stream, _) = self.inner.accept().await?;
        framed(stream, &self.config)
    }
}
