use crate::{
    address::{Address, VsockEndpoint},
    error::Result,
    listen::StreamListener,
    proxy::Lifecycle,
};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    net::TcpStream,
    select,
};
use tokio_util::sync::CancellationToken;
use tokio_vsock::VsockStream;
use tracing::{error, info};

/// TcpBackend is where a stream proxy dials for every accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpBackend {
    Tcp(SocketAddr),
    Vsock(VsockEndpoint),
}

impl From<TcpBackend> for Address {
    fn from(backend: TcpBackend) -> Self {
        match backend {
            TcpBackend::Tcp(addr) => Address::Stream(addr),
            TcpBackend::Vsock(ep) => Address::Vsock(ep),
        }
    }
}

/// TcpProxy relays byte streams accepted on a TCP or vsock listener
pub struct TcpProxy {
    frontend: Address,
    backend: TcpBackend,
    lifecycle: Lifecycle<StreamListener>,
}

impl TcpProxy {
    /// new is a constructor for the TcpProxy type
    pub fn new(frontend: Address, listener: StreamListener, backend: TcpBackend) -> Self {
        Self {
            frontend,
            backend,
            lifecycle: Lifecycle::new(listener),
        }
    }

    /// frontend_addr returns the address the listener is bound to
    pub fn frontend_addr(&self) -> Address {
        self.frontend
    }

    /// backend_addr returns the address each client is relayed to
    pub fn backend_addr(&self) -> Address {
        self.backend.into()
    }

    /// is_closed reports whether close was called or the listener failed
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// close stops accepting and drops every client, safe to call twice
    pub fn close(&self) {
        self.lifecycle.close();
    }

    /// run accepts connections until the proxy is closed
    pub async fn run(&self) -> Result<()> {
        let (listener, cancel) = self.lifecycle.start()?;

        // DEBUG
        info!(
            "tcp proxy running: {} -> {}",
            self.frontend,
            self.backend_addr()
        );

        let res = match listener {
            StreamListener::Tcp(listener) => loop {
                let (inbound, peer_addr) = select! {
                    _ = cancel.cancelled() => break Ok(()),
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(e.into()),
                    },
                };
                let peer = Address::Stream(peer_addr);
                spawn_relay(inbound, peer, self.backend, cancel.clone());
            },
            StreamListener::Vsock(mut listener) => loop {
                let (inbound, peer_addr) = select! {
                    _ = cancel.cancelled() => break Ok(()),
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => break Err(e.into()),
                    },
                };
                let peer = Address::Vsock(peer_addr.into());
                spawn_relay(inbound, peer, self.backend, cancel.clone());
            },
        };

        // DEBUG
        info!("tcp proxy stopped: {}", self.frontend);

        // A failed listener takes its relays down with it
        self.lifecycle.finish(res)
    }
}

/// spawn_relay hands an accepted connection to its own task, which stops
/// early when the proxy is closed
fn spawn_relay<S>(inbound: S, peer: Address, backend: TcpBackend, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // DEBUG
        info!("new client: {}", peer);

        select! {
            _ = cancel.cancelled() => {
                info!("proxy closed, dropping client {}", peer);
            }
            res = relay(inbound, backend) => {
                if let Err(e) = res {
                    error!("[ERR] connection error for {}: {}", peer, e);
                }
            }
        }
    });
}

/// relay dials the backend and copies bytes in both directions until
/// either side closes
async fn relay<S>(mut inbound: S, backend: TcpBackend) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (from_client, from_backend) = match backend {
        TcpBackend::Tcp(addr) => {
            let mut outbound = TcpStream::connect(addr).await?;
            copy_bidirectional(&mut inbound, &mut outbound).await?
        }
        TcpBackend::Vsock(ep) => {
            let mut outbound = VsockStream::connect(ep.into()).await?;
            copy_bidirectional(&mut inbound, &mut outbound).await?
        }
    };

    // DEBUG
    info!(
        "connection closed: {} bytes from client, {} bytes from backend",
        from_client, from_backend
    );

    Ok(())
}
