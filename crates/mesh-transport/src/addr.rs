use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::{PeerId, TransportError};

/// Where to dial a peer: the `host` and `port` halves of its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
}

impl DialTarget {
    /// Parse `host:port`, splitting on the last colon.
    pub fn parse(identity: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidIdentity(identity.to_string());
        let (host, port) = identity.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// First IPv4 address of an interface that is up and not loopback.
///
/// Falls back to `127.0.0.1` when the interface query finds nothing usable.
pub fn local_network_address() -> IpAddr {
    for iface in netdev::get_interfaces() {
        if !iface.is_up() {
            continue;
        }
        for net in &iface.ipv4 {
            let addr = net.addr();
            if addr.is_loopback() || addr.is_link_local() {
                continue;
            }
            debug!(interface = %iface.name, %addr, "addr: using local network address");
            return IpAddr::V4(addr);
        }
    }
    debug!("addr: no usable interface, falling back to loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Expand a bare port into a full identity.
///
/// An identity made only of digits means "this port on my network
/// address"; anything else is taken verbatim.
pub fn resolve_local_identity(raw: &str) -> PeerId {
    if is_bare_port(raw) {
        PeerId::from(format!("{}:{raw}", local_network_address()))
    } else {
        PeerId::from(raw)
    }
}

fn is_bare_port(raw: &str) -> bool {
    !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit())
}
