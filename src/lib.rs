//! A lightweight port-forwarding proxy library
//!
//! - Features:
//!     - TCP -> TCP and TCP -> vsock stream forwarding
//!     - UDP -> UDP forwarding with per-client connection tracking
//!     - vsock listeners (any CID) forwarding to TCP, or to UDP with
//!       length-prefixed datagram framing
//!     - Best-effort binding that skips addresses missing from this environment
//!     - Async using tokio, `close` from any task stops `run` promptly
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use portproxy::{Address, new_proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let frontend: Address = "tcp:127.0.0.1:3000".parse()?;
//!     let backend: Address = "tcp:172.17.42.108:4000".parse()?;
//!
//!     let proxy = Arc::new(new_proxy(&frontend, &backend).await?);
//!     let runner = tokio::spawn({
//!         let proxy = Arc::clone(&proxy);
//!         async move { proxy.run().await }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     proxy.close();
//!     runner.await??;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod dispatch;
pub mod error;
pub mod listen;
pub mod proxy;
pub mod tcp;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::{Address, Cid, TransportKind, VsockEndpoint};
pub use dispatch::{
    Plan, new_best_effort_ip_proxy, new_ip_proxy, new_proxy, new_vsock_proxy, plan,
};
pub use error::{ProxyError, is_address_unavailable};
pub use listen::{Listen, SystemListen};
pub use proxy::Proxy;
