use std::{io, net::SocketAddr};
use tokio::net::{TcpListener, UdpSocket};
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener};
use tracing::debug;

/// Listen opens the listening resource for each transport kind
///
/// Factories go through this trait so construction failures can be
/// injected without touching the real network stack.
pub trait Listen {
    /// listen_stream binds a TCP listener
    fn listen_stream(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<TcpListener>> + Send;

    /// listen_datagram binds a UDP socket
    fn listen_datagram(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<UdpSocket>> + Send;

    /// listen_vsock binds a vsock listener accepting from any context
    fn listen_vsock(&self, port: u32) -> io::Result<VsockListener>;
}

/// SystemListen binds real sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemListen;

impl Listen for SystemListen {
    async fn listen_stream(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;

        // DEBUG
        debug!("tcp listener bound on {}", listener.local_addr()?);

        Ok(listener)
    }

    async fn listen_datagram(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(addr).await?;

        // DEBUG
        debug!("udp socket bound on {}", socket.local_addr()?);

        Ok(socket)
    }

    fn listen_vsock(&self, port: u32) -> io::Result<VsockListener> {
        let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))?;

        // DEBUG
        debug!("vsock listener bound on port {}", port);

        Ok(listener)
    }
}

/// StreamListener is a listening resource handing out byte streams
pub enum StreamListener {
    Tcp(TcpListener),
    Vsock(VsockListener),
}

/// DatagramListener is a listening resource handing out datagrams,
/// either directly or framed over accepted vsock connections
pub enum DatagramListener {
    Udp(UdpSocket),
    Vsock(VsockListener),
}
