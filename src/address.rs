use crate::error::ProxyError;
use std::{fmt, net::SocketAddr, str::FromStr};
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr};

/// TransportKind names the transport of an Address without its endpoint data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Datagram,
    Vsock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "tcp"),
            TransportKind::Datagram => write!(f, "udp"),
            TransportKind::Vsock => write!(f, "vsock"),
        }
    }
}

/// Cid is a vsock context id; Any accepts connections from every context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cid {
    Any,
    Id(u32),
}

impl Cid {
    /// raw returns the value handed to the kernel
    pub fn raw(self) -> u32 {
        match self {
            Cid::Any => VMADDR_CID_ANY,
            Cid::Id(id) => id,
        }
    }
}

impl From<u32> for Cid {
    fn from(raw: u32) -> Self {
        if raw == VMADDR_CID_ANY {
            Cid::Any
        } else {
            Cid::Id(raw)
        }
    }
}

/// VsockEndpoint is a context id + port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockEndpoint {
    pub cid: Cid,
    pub port: u32,
}

impl VsockEndpoint {
    /// new is a constructor for the VsockEndpoint type
    pub fn new(cid: Cid, port: u32) -> Self {
        Self { cid, port }
    }

    /// any builds an endpoint accepting from any context on the given port
    pub fn any(port: u32) -> Self {
        Self::new(Cid::Any, port)
    }
}

impl From<VsockEndpoint> for VsockAddr {
    fn from(ep: VsockEndpoint) -> Self {
        VsockAddr::new(ep.cid.raw(), ep.port)
    }
}

impl From<VsockAddr> for VsockEndpoint {
    fn from(addr: VsockAddr) -> Self {
        Self::new(Cid::from(addr.cid()), addr.port())
    }
}

/// Address identifies one side of a proxy: the transport kind plus
/// the endpoint data for that kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Stream(SocketAddr),
    Datagram(SocketAddr),
    Vsock(VsockEndpoint),
}

impl Address {
    pub fn kind(&self) -> TransportKind {
        match self {
            Address::Stream(_) => TransportKind::Stream,
            Address::Datagram(_) => TransportKind::Datagram,
            Address::Vsock(_) => TransportKind::Vsock,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Stream(addr) => write!(f, "tcp:{addr}"),
            Address::Datagram(addr) => write!(f, "udp:{addr}"),
            Address::Vsock(VsockEndpoint { cid: Cid::Any, port }) => write!(f, "vsock:any:{port}"),
            Address::Vsock(VsockEndpoint {
                cid: Cid::Id(id),
                port,
            }) => write!(f, "vsock:{id}:{port}"),
        }
    }
}

/// Address parsing
///
/// Accepted forms:
/// - `tcp:127.0.0.1:3000`, `udp:[::1]:53`
/// - `vsock:any:4000`, `vsock:-1:4000`, `vsock:3:4000`
impl FromStr for Address {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProxyError::InvalidAddress(s.to_string());

        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Address::Stream(rest.parse().map_err(|_| invalid())?)),
            "udp" => Ok(Address::Datagram(rest.parse().map_err(|_| invalid())?)),
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;

                let cid = match cid.to_ascii_lowercase().as_str() {
                    "any" | "-1" => Cid::Any,
                    raw => Cid::from(raw.parse::<u32>().map_err(|_| invalid())?),
                };
                let port = port.parse::<u32>().map_err(|_| invalid())?;

                Ok(Address::Vsock(VsockEndpoint::new(cid, port)))
            }
            _ => Err(invalid()),
        }
    }
}
