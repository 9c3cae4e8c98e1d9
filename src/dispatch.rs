//! Proxy construction
//!
//! The frontend's transport decides which listener is opened; the backend's
//! transport only picks the forwarding variant once that listener exists.
//!
//! | frontend | backend  | IP factory     | vsock factory  |
//! |----------|----------|----------------|----------------|
//! | udp      | udp      | `Udp`          | -              |
//! | tcp      | tcp      | `Tcp`          | -              |
//! | tcp      | vsock    | `Tcp`          | -              |
//! | vsock    | tcp      | `VsockTcp`     | `VsockTcp`     |
//! | vsock    | udp      | unsupported    | `VsockUdp`     |
//!
//! Every other pair is `ProxyError::UnsupportedProtocol`.

use crate::{
    address::{Address, VsockEndpoint},
    error::{ProxyError, Result, is_address_unavailable},
    listen::{DatagramListener, Listen, StreamListener, SystemListen},
    proxy::Proxy,
    tcp::{TcpBackend, TcpProxy},
    udp::UdpProxy,
};
use std::net::SocketAddr;
use tracing::info;

/// Plan is the constructor selected for a frontend/backend pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// UDP socket on the frontend, UDP backend
    Udp {
        frontend: SocketAddr,
        backend: SocketAddr,
    },
    /// TCP listener on the frontend, TCP or vsock backend
    Tcp {
        frontend: SocketAddr,
        backend: TcpBackend,
    },
    /// vsock listener on the frontend port, TCP backend
    VsockTcp {
        frontend: VsockEndpoint,
        backend: SocketAddr,
    },
    /// vsock listener on the frontend port carrying framed datagrams, UDP backend
    VsockUdp {
        frontend: VsockEndpoint,
        backend: SocketAddr,
    },
}

fn unsupported(frontend: &Address, backend: &Address) -> ProxyError {
    ProxyError::UnsupportedProtocol {
        frontend: frontend.kind(),
        backend: backend.kind(),
    }
}

/// plan_ip is the dispatch table of the IP factory
///
/// A vsock frontend is only paired with a stream backend here; datagrams
/// over vsock go through `plan_vsock`.
pub fn plan_ip(frontend: &Address, backend: &Address) -> Result<Plan> {
    match (*frontend, *backend) {
        (Address::Datagram(frontend), Address::Datagram(backend)) => {
            Ok(Plan::Udp { frontend, backend })
        }
        (Address::Stream(frontend), Address::Stream(backend)) => Ok(Plan::Tcp {
            frontend,
            backend: TcpBackend::Tcp(backend),
        }),
        (Address::Stream(frontend), Address::Vsock(backend)) => Ok(Plan::Tcp {
            frontend,
            backend: TcpBackend::Vsock(backend),
        }),
        (Address::Vsock(frontend), Address::Stream(backend)) => {
            Ok(Plan::VsockTcp { frontend, backend })
        }
        _ => Err(unsupported(frontend, backend)),
    }
}

/// plan_vsock is the dispatch table of the vsock factory
pub fn plan_vsock(frontend: &Address, backend: &Address) -> Result<Plan> {
    match (*frontend, *backend) {
        (Address::Vsock(frontend), Address::Datagram(backend)) => {
            Ok(Plan::VsockUdp { frontend, backend })
        }
        (Address::Vsock(frontend), Address::Stream(backend)) => {
            Ok(Plan::VsockTcp { frontend, backend })
        }
        _ => Err(unsupported(frontend, backend)),
    }
}

/// plan routes vsock frontends to the vsock table and everything else to
/// the IP table
pub fn plan(frontend: &Address, backend: &Address) -> Result<Plan> {
    match frontend {
        Address::Vsock(_) => plan_vsock(frontend, backend),
        _ => plan_ip(frontend, backend),
    }
}

/// build opens the listener a plan calls for and wraps it in a Proxy
///
/// Listen failures always come back as `ProxyError::Listen` carrying the
/// untouched OS error.
pub async fn build(listen: &impl Listen, plan: Plan) -> Result<Proxy> {
    let proxy = match plan {
        Plan::Udp { frontend, backend } => {
            let socket = listen
                .listen_datagram(frontend)
                .await
                .map_err(|source| listen_error(Address::Datagram(frontend), source))?;
            let bound = Address::Datagram(socket.local_addr()?);

            UdpProxy::new(bound, DatagramListener::Udp(socket), backend).into()
        }
        Plan::Tcp { frontend, backend } => {
            let listener = listen
                .listen_stream(frontend)
                .await
                .map_err(|source| listen_error(Address::Stream(frontend), source))?;
            let bound = Address::Stream(listener.local_addr()?);

            TcpProxy::new(bound, StreamListener::Tcp(listener), backend).into()
        }
        Plan::VsockTcp { frontend, backend } => {
            let listener = listen
                .listen_vsock(frontend.port)
                .map_err(|source| listen_error(Address::Vsock(frontend), source))?;

            TcpProxy::new(
                Address::Vsock(frontend),
                StreamListener::Vsock(listener),
                TcpBackend::Tcp(backend),
            )
            .into()
        }
        Plan::VsockUdp { frontend, backend } => {
            let listener = listen
                .listen_vsock(frontend.port)
                .map_err(|source| listen_error(Address::Vsock(frontend), source))?;

            UdpProxy::new(
                Address::Vsock(frontend),
                DatagramListener::Vsock(listener),
                backend,
            )
            .into()
        }
    };

    Ok(proxy)
}

fn listen_error(addr: Address, source: std::io::Error) -> ProxyError {
    ProxyError::Listen { addr, source }
}

/// new_proxy creates a Proxy for any supported frontend/backend pair
pub async fn new_proxy(frontend: &Address, backend: &Address) -> Result<Proxy> {
    build(&SystemListen, plan(frontend, backend)?).await
}

/// new_ip_proxy creates a Proxy according to the specified frontend and backend
pub async fn new_ip_proxy(frontend: &Address, backend: &Address) -> Result<Proxy> {
    new_ip_proxy_with(&SystemListen, frontend, backend).await
}

/// new_ip_proxy_with is new_ip_proxy over a caller supplied Listen
pub async fn new_ip_proxy_with(
    listen: &impl Listen,
    frontend: &Address,
    backend: &Address,
) -> Result<Proxy> {
    build(listen, plan_ip(frontend, backend)?).await
}

/// new_vsock_proxy creates a Proxy listening on vsock, any CID, at the
/// frontend's port
pub async fn new_vsock_proxy(frontend: VsockEndpoint, backend: &Address) -> Result<Proxy> {
    new_vsock_proxy_with(&SystemListen, frontend, backend).await
}

/// new_vsock_proxy_with is new_vsock_proxy over a caller supplied Listen
pub async fn new_vsock_proxy_with(
    listen: &impl Listen,
    frontend: VsockEndpoint,
    backend: &Address,
) -> Result<Proxy> {
    build(listen, plan_vsock(&Address::Vsock(frontend), backend)?).await
}

/// new_best_effort_ip_proxy tries to listen on an address that may only
/// exist outside this environment (e.g. a host address seen from inside a VM)
///
/// Returns `Ok(None)` when the frontend address is not available here; any
/// other failure is returned unchanged.
pub async fn new_best_effort_ip_proxy(
    frontend: &Address,
    backend: &Address,
) -> Result<Option<Proxy>> {
    new_best_effort_ip_proxy_with(&SystemListen, frontend, backend).await
}

/// new_best_effort_ip_proxy_with is new_best_effort_ip_proxy over a caller
/// supplied Listen
pub async fn new_best_effort_ip_proxy_with(
    listen: &impl Listen,
    frontend: &Address,
    backend: &Address,
) -> Result<Option<Proxy>> {
    match new_ip_proxy_with(listen, frontend, backend).await {
        Ok(proxy) => Ok(Some(proxy)),
        Err(e) if is_address_unavailable(&e) => {
            info!(
                "address {} doesn't exist in the VM: only binding on the host",
                frontend
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Cid, TransportKind};
    use std::{
        io,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::net::{TcpListener, UdpSocket};
    use tokio_vsock::VsockListener;

    fn tcp(s: &str) -> Address {
        Address::Stream(s.parse().unwrap())
    }

    fn udp(s: &str) -> Address {
        Address::Datagram(s.parse().unwrap())
    }

    fn vsock(port: u32) -> Address {
        Address::Vsock(VsockEndpoint::any(port))
    }

    /// FailingListen fails every listen call with the same error kind and
    /// counts the calls
    struct FailingListen {
        kind: io::ErrorKind,
        calls: AtomicUsize,
    }

    impl FailingListen {
        fn new(kind: io::ErrorKind) -> Self {
            Self {
                kind,
                calls: AtomicUsize::new(0),
            }
        }

        fn fail(&self) -> io::Error {
            self.calls.fetch_add(1, Ordering::SeqCst);
            io::Error::from(self.kind)
        }
    }

    impl Listen for FailingListen {
        async fn listen_stream(&self, _addr: SocketAddr) -> io::Result<TcpListener> {
            Err(self.fail())
        }

        async fn listen_datagram(&self, _addr: SocketAddr) -> io::Result<UdpSocket> {
            Err(self.fail())
        }

        fn listen_vsock(&self, _port: u32) -> io::Result<VsockListener> {
            Err(self.fail())
        }
    }

    /// CapturedLogs collects formatted tracing output
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn lines_containing(&self, needle: &str) -> usize {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .filter(|line| line.contains(needle))
                .count()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ip_dispatch_table() {
        assert_eq!(
            plan_ip(&udp("0.0.0.0:53"), &udp("10.0.0.2:53")).unwrap(),
            Plan::Udp {
                frontend: "0.0.0.0:53".parse().unwrap(),
                backend: "10.0.0.2:53".parse().unwrap(),
            }
        );
        assert_eq!(
            plan_ip(&tcp("127.0.0.1:3000"), &tcp("172.17.42.108:4000")).unwrap(),
            Plan::Tcp {
                frontend: "127.0.0.1:3000".parse().unwrap(),
                backend: TcpBackend::Tcp("172.17.42.108:4000".parse().unwrap()),
            }
        );
        assert_eq!(
            plan_ip(&tcp("0.0.0.0:8080"), &vsock(8080)).unwrap(),
            Plan::Tcp {
                frontend: "0.0.0.0:8080".parse().unwrap(),
                backend: TcpBackend::Vsock(VsockEndpoint::any(8080)),
            }
        );
        assert_eq!(
            plan_ip(&vsock(4000), &tcp("10.0.0.2:80")).unwrap(),
            Plan::VsockTcp {
                frontend: VsockEndpoint::any(4000),
                backend: "10.0.0.2:80".parse().unwrap(),
            }
        );
    }

    #[test]
    fn ip_dispatch_rejects_mismatched_pairs() {
        let cases = [
            (udp("0.0.0.0:53"), tcp("10.0.0.2:53")),
            (udp("0.0.0.0:53"), vsock(53)),
            (tcp("0.0.0.0:80"), udp("10.0.0.2:80")),
            (vsock(53), udp("10.0.0.2:53")),
            (vsock(1), vsock(2)),
        ];

        for (frontend, backend) in cases {
            match plan_ip(&frontend, &backend) {
                Err(ProxyError::UnsupportedProtocol {
                    frontend: f,
                    backend: b,
                }) => {
                    assert_eq!(f, frontend.kind());
                    assert_eq!(b, backend.kind());
                }
                other => panic!("{frontend} -> {backend}: {other:?}"),
            }
        }
    }

    #[test]
    fn vsock_dispatch_table() {
        let frontend = Address::Vsock(VsockEndpoint::new(Cid::Any, 4000));

        assert_eq!(
            plan_vsock(&frontend, &udp("10.0.0.2:53")).unwrap(),
            Plan::VsockUdp {
                frontend: VsockEndpoint::any(4000),
                backend: "10.0.0.2:53".parse().unwrap(),
            }
        );
        assert_eq!(
            plan_vsock(&frontend, &tcp("10.0.0.2:80")).unwrap(),
            Plan::VsockTcp {
                frontend: VsockEndpoint::any(4000),
                backend: "10.0.0.2:80".parse().unwrap(),
            }
        );
        assert!(matches!(
            plan_vsock(&frontend, &vsock(1)),
            Err(ProxyError::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            plan_vsock(&tcp("0.0.0.0:80"), &tcp("10.0.0.2:80")),
            Err(ProxyError::UnsupportedProtocol {
                frontend: TransportKind::Stream,
                backend: TransportKind::Stream,
            })
        ));
    }

    #[test]
    fn plan_picks_table_by_frontend() {
        // vsock frontend with datagram backend is only known to the vsock table
        assert!(matches!(
            plan(&vsock(4000), &udp("10.0.0.2:53")),
            Ok(Plan::VsockUdp { .. })
        ));
        assert!(matches!(
            plan(&tcp("0.0.0.0:80"), &vsock(80)),
            Ok(Plan::Tcp {
                backend: TcpBackend::Vsock(_),
                ..
            })
        ));
        assert!(matches!(
            plan(&udp("0.0.0.0:53"), &tcp("10.0.0.2:53")),
            Err(ProxyError::UnsupportedProtocol { .. })
        ));
    }

    #[tokio::test]
    async fn ip_stream_proxy_keeps_frontend() {
        let frontend = tcp("127.0.0.1:0");
        let backend = tcp("172.17.42.108:4000");

        let proxy = new_ip_proxy(&frontend, &backend).await.unwrap();
        assert!(matches!(proxy, Proxy::Tcp(_)));
        assert_eq!(proxy.backend_addr(), backend);

        let Address::Stream(bound) = proxy.frontend_addr() else {
            panic!("expected a stream frontend");
        };
        assert_eq!(bound.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(bound.port(), 0);

        proxy.close();
    }

    #[tokio::test]
    async fn ip_datagram_proxy_is_built() {
        let proxy = new_proxy(&udp("127.0.0.1:0"), &udp("127.0.0.1:53"))
            .await
            .unwrap();
        assert!(matches!(proxy, Proxy::Udp(_)));
        assert_eq!(proxy.frontend_addr().kind(), TransportKind::Datagram);
        proxy.close();
    }

    #[tokio::test]
    async fn unsupported_pair_is_an_error_not_a_panic() {
        let res = new_ip_proxy(&udp("127.0.0.1:0"), &tcp("127.0.0.1:80")).await;
        assert!(matches!(
            res,
            Err(ProxyError::UnsupportedProtocol {
                frontend: TransportKind::Datagram,
                backend: TransportKind::Stream,
            })
        ));
    }

    #[tokio::test]
    async fn vsock_listen_failure_is_hard() {
        let listen = FailingListen::new(io::ErrorKind::AddrNotAvailable);
        let res = new_vsock_proxy_with(&listen, VsockEndpoint::any(4000), &udp("10.0.0.2:53")).await;

        match res {
            Err(ProxyError::Listen { addr, source }) => {
                assert_eq!(addr, vsock(4000));
                assert_eq!(source.kind(), io::ErrorKind::AddrNotAvailable);
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected a listen error"),
        }
        assert_eq!(listen.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn best_effort_returns_live_proxy_on_success() {
        let proxy = new_best_effort_ip_proxy(&tcp("127.0.0.1:0"), &tcp("127.0.0.1:80"))
            .await
            .unwrap()
            .expect("bind on loopback succeeds");
        assert!(matches!(proxy, Proxy::Tcp(_)));
        proxy.close();
    }

    #[tokio::test]
    async fn best_effort_treats_unavailable_address_as_absent() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let listen = FailingListen::new(io::ErrorKind::AddrNotAvailable);
        let res =
            new_best_effort_ip_proxy_with(&listen, &tcp("192.168.65.2:80"), &tcp("10.0.0.2:80"))
                .await;

        assert!(matches!(res, Ok(None)));
        assert_eq!(listen.calls.load(Ordering::SeqCst), 1);
        assert_eq!(logs.lines_containing("tcp:192.168.65.2:80"), 1);
    }

    #[tokio::test]
    async fn best_effort_propagates_other_failures() {
        let listen = FailingListen::new(io::ErrorKind::PermissionDenied);
        let res = new_best_effort_ip_proxy_with(&listen, &udp("0.0.0.0:53"), &udp("10.0.0.2:53")).await;

        match res {
            Err(ProxyError::Listen { addr, source }) => {
                assert_eq!(addr, udp("0.0.0.0:53"));
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected a hard error"),
        }
    }

    #[tokio::test]
    async fn best_effort_propagates_unsupported_protocol() {
        let listen = FailingListen::new(io::ErrorKind::AddrNotAvailable);
        let res = new_best_effort_ip_proxy_with(&listen, &udp("0.0.0.0:53"), &tcp("10.0.0.2:53")).await;

        assert!(matches!(res, Err(ProxyError::UnsupportedProtocol { .. })));
        assert_eq!(listen.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn best_effort_never_softens_vsock_listen_failures() {
        let listen = FailingListen::new(io::ErrorKind::AddrNotAvailable);
        let res = new_best_effort_ip_proxy_with(&listen, &vsock(4000), &tcp("10.0.0.2:80")).await;

        assert!(matches!(res, Err(ProxyError::Listen { .. })));
    }
}
