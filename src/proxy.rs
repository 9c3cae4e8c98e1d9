use crate::{
    address::Address,
    error::{ProxyError, Result},
    tcp::TcpProxy,
    udp::UdpProxy,
};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Proxy forwards traffic back and forth between a frontend and a backend
///
/// e.g. forward all traffic between the frontend (host) 127.0.0.1:3000
/// and the backend (container) at 172.17.42.108:4000.
///
/// A Proxy is created already bound to its frontend. `run` may be driven
/// from its own task while `close` is called from anywhere else.
pub enum Proxy {
    Tcp(TcpProxy),
    Udp(UdpProxy),
}

impl Proxy {
    /// run starts forwarding and only returns once the proxy is closed
    /// or its listener fails
    pub async fn run(&self) -> Result<()> {
        match self {
            Proxy::Tcp(proxy) => proxy.run().await,
            Proxy::Udp(proxy) => proxy.run().await,
        }
    }

    /// close stops forwarding and releases both ends, repeated calls are no-ops
    pub fn close(&self) {
        match self {
            Proxy::Tcp(proxy) => proxy.close(),
            Proxy::Udp(proxy) => proxy.close(),
        }
    }

    /// frontend_addr returns the address the proxy is listening on
    pub fn frontend_addr(&self) -> Address {
        match self {
            Proxy::Tcp(proxy) => proxy.frontend_addr(),
            Proxy::Udp(proxy) => proxy.frontend_addr(),
        }
    }

    /// backend_addr returns the proxied address
    pub fn backend_addr(&self) -> Address {
        match self {
            Proxy::Tcp(proxy) => proxy.backend_addr(),
            Proxy::Udp(proxy) => proxy.backend_addr(),
        }
    }

    /// is_closed reports whether the proxy was closed or its listener failed
    pub fn is_closed(&self) -> bool {
        match self {
            Proxy::Tcp(proxy) => proxy.is_closed(),
            Proxy::Udp(proxy) => proxy.is_closed(),
        }
    }
}

impl From<TcpProxy> for Proxy {
    fn from(proxy: TcpProxy) -> Self {
        Proxy::Tcp(proxy)
    }
}

impl From<UdpProxy> for Proxy {
    fn from(proxy: UdpProxy) -> Self {
        Proxy::Udp(proxy)
    }
}

/// Lifecycle owns a proxy's listening resource until `run` takes it and
/// tracks the Unstarted -> Running -> Closed transitions
pub(crate) struct Lifecycle<L> {
    listener: Mutex<Option<L>>,
    cancel: CancellationToken,
}

impl<L> Lifecycle<L> {
    /// new is a constructor for the Lifecycle type
    pub(crate) fn new(listener: L) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            cancel: CancellationToken::new(),
        }
    }

    /// start hands the listener to the caller of `run`, exactly once
    pub(crate) fn start(&self) -> Result<(L, CancellationToken)> {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        let listener = slot.take();

        // close cancels before it takes the listener, so check after taking
        match listener {
            _ if self.cancel.is_cancelled() => Err(ProxyError::Closed),
            Some(listener) => Ok((listener, self.cancel.clone())),
            None => Err(ProxyError::AlreadyStarted),
        }
    }

    /// finish marks a proxy whose forwarding loop failed as closed, so its
    /// spawned relays stop and `is_closed` reports the truth
    pub(crate) fn finish(&self, res: Result<()>) -> Result<()> {
        if res.is_err() {
            self.close();
        }
        res
    }

    /// close cancels a running proxy or drops the listener of one that never ran
    pub(crate) fn close(&self) {
        self.cancel.cancel();

        // Release the listener if run never took it
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(listener);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
