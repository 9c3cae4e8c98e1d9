use crate::{
    address::Address,
    error::Result,
    listen::DatagramListener,
    proxy::Lifecycle,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, select, sync::Mutex};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tokio_vsock::VsockStream;
use tracing::{debug, error, info};

/// Largest payload a single UDP datagram can carry
pub const MAX_DGRAM: usize = 65507;

/// Idle time after which a client's backend socket is dropped
pub const DEFAULT_CONNTRACK_TIMEOUT: Duration = Duration::from_secs(90);

/// ConnTrackEntry is the backend socket dedicated to one client
struct ConnTrackEntry {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
    cancel: CancellationToken,
}

/// ConnTrack maps client addresses to their backend sockets
type ConnTrack = Arc<Mutex<HashMap<SocketAddr, ConnTrackEntry>>>;

/// UdpProxy relays datagrams received on a UDP socket, or framed over
/// accepted vsock connections, to a UDP backend
pub struct UdpProxy {
    frontend: Address,
    backend: SocketAddr,
    timeout: Duration,
    lifecycle: Lifecycle<DatagramListener>,
}

impl UdpProxy {
    /// new is a constructor for the UdpProxy type
    pub fn new(frontend: Address, listener: DatagramListener, backend: SocketAddr) -> Self {
        Self {
            frontend,
            backend,
            timeout: DEFAULT_CONNTRACK_TIMEOUT,
            lifecycle: Lifecycle::new(listener),
        }
    }

    /// with_timeout sets how long an idle client keeps its backend socket
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// frontend_addr returns the address datagrams are received on
    pub fn frontend_addr(&self) -> Address {
        self.frontend
    }

    /// backend_addr returns the UDP address datagrams are relayed to
    pub fn backend_addr(&self) -> Address {
        Address::Datagram(self.backend)
    }

    /// is_closed reports whether close was called or the listener failed
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// close stops forwarding and drops every client socket, safe to call twice
    pub fn close(&self) {
        self.lifecycle.close();
    }

    /// run forwards datagrams until the proxy is closed
    pub async fn run(&self) -> Result<()> {
        let (listener, cancel) = self.lifecycle.start()?;

        // DEBUG
        info!(
            "udp proxy running: {} -> {}",
            self.frontend,
            self.backend_addr()
        );

        let res = match listener {
            DatagramListener::Udp(socket) => self.run_udp(socket, cancel).await,
            DatagramListener::Vsock(mut listener) => loop {
                let (stream, peer_addr) = select! {
                    _ = cancel.cancelled() => break Ok(()),
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(e.into()),
                    },
                };

                let peer = Address::Vsock(peer_addr.into());
                let backend = self.backend;
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    // DEBUG
                    info!("new vsock datagram client: {}", peer);

                    if let Err(e) = relay_framed(stream, backend, cancel).await {
                        error!("[ERR] vsock datagram relay for {} failed: {}", peer, e);
                    }
                });
            },
        };

        // DEBUG
        info!("udp proxy stopped: {}", self.frontend);

        // A failed listener takes its relays down with it
        self.lifecycle.finish(res)
    }

    /// run_udp is the receive loop of a plain UDP frontend
    async fn run_udp(&self, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let frontend = Arc::new(socket);
        let conntrack: ConnTrack = Arc::new(Mutex::new(HashMap::new()));

        // Instantiate receive buffer
        let mut buffer = vec![0u8; MAX_DGRAM];

        // Sweep at least every 30s, sooner for short timeouts
        let period = self
            .timeout
            .clamp(Duration::from_secs(1), Duration::from_secs(30));
        let mut sweep = tokio::time::interval(period);

        let res = loop {
            select! {
                _ = cancel.cancelled() => break Ok(()),

                _ = sweep.tick() => {
                    cleanup_expired_connections(&conntrack, self.timeout).await;
                }

                // Client -> backend
                incoming = frontend.recv_from(&mut buffer) => {
                    let (len, client_addr) = match incoming {
                        Ok(v) => v,
                        Err(e) => break Err(e.into()),
                    };

                    if let Err(e) = self
                        .forward_to_backend(&frontend, &conntrack, client_addr, &buffer[..len], &cancel)
                        .await
                    {
                        error!("[ERR] failed to forward datagram from {}: {}", client_addr, e);
                    }
                }
            }
        };

        // Stop every per-client reply task
        for (_, entry) in conntrack.lock().await.drain() {
            entry.cancel.cancel();
        }

        res
    }

    /// forward_to_backend sends a client's datagram through that client's
    /// backend socket, creating the socket on first use
    async fn forward_to_backend(
        &self,
        frontend: &Arc<UdpSocket>,
        conntrack: &ConnTrack,
        client_addr: SocketAddr,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let socket = {
            let mut state = conntrack.lock().await;

            match state.get_mut(&client_addr) {
                Some(entry) => {
                    entry.last_activity = Instant::now();
                    Arc::clone(&entry.socket)
                }
                None => {
                    let socket = Arc::new(connect_backend(self.backend).await?);

                    // DEBUG
                    info!(
                        "created udp relay: {} -> {} (via {})",
                        client_addr,
                        self.backend,
                        socket.local_addr()?
                    );

                    let entry_cancel = cancel.child_token();
                    tokio::spawn(reply_to_client(
                        Arc::clone(&socket),
                        Arc::clone(frontend),
                        Arc::clone(conntrack),
                        client_addr,
                        entry_cancel.clone(),
                    ));

                    state.insert(
                        client_addr,
                        ConnTrackEntry {
                            socket: Arc::clone(&socket),
                            last_activity: Instant::now(),
                            cancel: entry_cancel,
                        },
                    );

                    socket
                }
            }
        };

        send_to_backend(&socket, data).await?;

        // DEBUG
        debug!(
            "forwarded {} bytes: {} -> {}",
            data.len(),
            client_addr,
            self.backend
        );

        Ok(())
    }
}

/// connect_backend binds an ephemeral socket of the backend's family and
/// connects it so only backend replies are received
async fn connect_backend(backend: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match backend {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(backend).await?;
    Ok(socket)
}

/// send_to_backend sends on a connected backend socket, retrying once when
/// the send only reports an earlier ICMP port unreachable
async fn send_to_backend(socket: &UdpSocket, data: &[u8]) -> std::io::Result<usize> {
    match socket.send(data).await {
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => socket.send(data).await,
        res => res,
    }
}

/// reply_to_client copies backend replies to the client through the
/// frontend socket until the entry is cancelled
///
/// A refused backend is not fatal: the backend may come up later. On any
/// other receive error the entry is dropped so the client's next datagram
/// opens a fresh socket.
async fn reply_to_client(
    socket: Arc<UdpSocket>,
    frontend: Arc<UdpSocket>,
    conntrack: ConnTrack,
    client_addr: SocketAddr,
    cancel: CancellationToken,
) {
    // Instantiate buffer
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        let len = select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buffer) => match received {
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!("backend refused datagram from {}", client_addr);
                    continue;
                }
                Err(e) => {
                    error!("[ERR] error receiving from backend for {}: {}", client_addr, e);
                    forget_client(&conntrack, client_addr, &socket).await;
                    break;
                }
            },
        };

        // Update last activity
        if let Some(entry) = conntrack.lock().await.get_mut(&client_addr) {
            entry.last_activity = Instant::now();
        }

        if let Err(e) = frontend.send_to(&buffer[..len], client_addr).await {
            error!("[ERR] error sending reply to {}: {}", client_addr, e);
            continue;
        }

        // DEBUG
        debug!("sent {} bytes back to client {}", len, client_addr);
    }

    // DEBUG
    debug!("stopped relaying replies for {}", client_addr);
}

/// forget_client removes a client's entry if it still holds this socket
async fn forget_client(conntrack: &ConnTrack, client_addr: SocketAddr, socket: &Arc<UdpSocket>) {
    let mut state = conntrack.lock().await;

    if state
        .get(&client_addr)
        .is_some_and(|entry| Arc::ptr_eq(&entry.socket, socket))
    {
        state.remove(&client_addr);
    }
}

/// cleanup_expired_connections drops backend sockets idle for longer
/// than the timeout
async fn cleanup_expired_connections(conntrack: &ConnTrack, timeout: Duration) {
    let now = Instant::now();
    let mut state = conntrack.lock().await;

    state.retain(|client_addr, entry| {
        if now.duration_since(entry.last_activity) <= timeout {
            return true;
        }

        entry.cancel.cancel();
        info!("removed expired udp relay for {}", client_addr);
        false
    });
}

/// datagram_codec frames each datagram as a u16 little-endian length
/// followed by the payload
pub fn datagram_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .little_endian()
        .max_frame_length(MAX_DGRAM)
        .new_codec()
}

/// relay_framed forwards framed datagrams from one vsock connection to
/// the backend and frames the replies back on the same connection
async fn relay_framed(
    stream: VsockStream,
    backend: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = connect_backend(backend).await?;
    let mut framed = Framed::new(stream, datagram_codec());

    // Instantiate buffer
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        select! {
            _ = cancel.cancelled() => break,

            frame = framed.next() => match frame {
                Some(frame) => {
                    let frame = frame?;
                    send_to_backend(&socket, &frame).await?;

                    // DEBUG
                    debug!("forwarded {} framed bytes to {}", frame.len(), backend);
                }
                None => {
                    // DEBUG
                    debug!("vsock datagram client disconnected");
                    break;
                }
            },

            received = socket.recv(&mut buffer) => match received {
                Ok(len) => framed.send(Bytes::copy_from_slice(&buffer[..len])).await?,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!("backend {} refused a framed datagram", backend);
                }
                Err(e) => return Err(e.into()),
            },
        }
    }

    Ok(())
}
