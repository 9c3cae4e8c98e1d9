use anyhow::{Context, Result, bail};
use clap::Parser;
use portproxy::{Address, Proxy, TransportKind, dispatch, udp::DEFAULT_CONNTRACK_TIMEOUT};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight TCP, UDP and vsock port-forwarding proxy", long_about = None)]
struct Args {
    /// Frontend address to listen on (tcp:HOST:PORT, udp:HOST:PORT, vsock:any:PORT)
    #[arg(short, long)]
    frontend: Address,

    /// Backend address to forward to (tcp:HOST:PORT, udp:HOST:PORT, vsock:CID:PORT)
    #[arg(short, long)]
    backend: Address,

    /// Skip the proxy instead of failing when the frontend address doesn't exist here
    /// (tcp and udp frontends only)
    #[arg(long, action)]
    best_effort: bool,

    /// Seconds an idle UDP client keeps its backend socket
    #[arg(long, default_value_t = DEFAULT_CONNTRACK_TIMEOUT.as_secs())]
    udp_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();
    check_args(&args)?;

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Build the proxy
    let proxy = if args.best_effort {
        match dispatch::new_best_effort_ip_proxy(&args.frontend, &args.backend).await? {
            Some(proxy) => proxy,
            None => return Ok(()),
        }
    } else {
        dispatch::new_proxy(&args.frontend, &args.backend)
            .await
            .with_context(|| format!("[ERR] failed to set up {} -> {}", args.frontend, args.backend))?
    };

    // Apply UDP connection tracking timeout
    let proxy = match proxy {
        Proxy::Udp(udp) => Proxy::Udp(udp.with_timeout(Duration::from_secs(args.udp_timeout))),
        other => other,
    };

    let proxy = Arc::new(proxy);

    // Run it
    info!(
        "Starting proxy: {} -> {}",
        proxy.frontend_addr(),
        proxy.backend_addr()
    );

    let runner = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.run().await })
    };

    // Close on Ctrl-C
    {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutting down"),
                Err(e) => error!("[ERR] failed to listen for ctrl-c: {}", e),
            }
            proxy.close();
        });
    }

    runner.await??;
    Ok(())
}

/// check_args rejects flag combinations the proxy can't honour
fn check_args(args: &Args) -> Result<()> {
    // vsock listen failures are never soft
    if args.best_effort && args.frontend.kind() == TransportKind::Vsock {
        bail!("[ERR] --best-effort only applies to tcp and udp frontends");
    }
    Ok(())
}
