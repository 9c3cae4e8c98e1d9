use crate::address::{Address, TransportKind};
use std::io;
use thiserror::Error;

/// ProxyError covers everything that can go wrong while building or
/// running a proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("unsupported protocol: {frontend} frontend with {backend} backend")]
    UnsupportedProtocol {
        frontend: TransportKind,
        backend: TransportKind,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: Address,
        #[source]
        source: io::Error,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("proxy is already running")]
    AlreadyStarted,

    #[error("proxy is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// is_address_unavailable reports whether a construction failure means the
/// frontend address does not exist in this environment (EADDRNOTAVAIL)
///
/// Only listen failures on IP addresses are considered: the error is
/// unwrapped to the underlying OS error and its kind compared. vsock listen
/// failures are always hard.
pub fn is_address_unavailable(err: &ProxyError) -> bool {
    match err {
        ProxyError::Listen { addr, source } => {
            addr.kind() != TransportKind::Vsock && source.kind() == io::ErrorKind::AddrNotAvailable
        }
        _ => false,
    }
}
