use anyhow::{bail, Result};
use clap::Parser;
use log::{debug, info, warn};
use pixelboard::transport::bind_reusable;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;

/// Round-robin reverse proxy in front of the cluster's client ports. Holds no
/// state beyond a rotation counter; each client connection is pinned to one
/// backend for its lifetime.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to accept client connections on
    #[arg(long, default_value = "127.0.0.1:7000")]
    listen: String,

    /// Comma-separated backend addresses (the nodes' client ports)
    #[arg(long, value_delimiter = ',', required = true)]
    backends: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.backends.is_empty() {
        bail!("at least one backend is required");
    }

    let backends = Arc::new(cli.backends);
    let next = Arc::new(AtomicUsize::new(0));
    let listener = bind_reusable(&cli.listen)?;
    info!(
        "balancer listening on {} in front of {:?}",
        cli.listen, backends
    );

    loop {
        let (inbound, addr) = listener.accept().await?;
        let backends = Arc::clone(&backends);
        let next = Arc::clone(&next);
        tokio::spawn(async move {
            if let Err(e) = proxy(inbound, &backends, &next).await {
                debug!("connection from {} dropped: {}", addr, e);
            }
        });
    }
}

/// Forward one client connection to the next live backend in rotation.
async fn proxy(
    mut inbound: TcpStream,
    backends: &[String],
    next: &AtomicUsize,
) -> Result<()> {
    let start = next.fetch_add(1, Ordering::Relaxed);
    for offset in 0..backends.len() {
        let backend = &backends[(start + offset) % backends.len()];
        match TcpStream::connect(backend).await {
            Ok(mut outbound) => {
                debug!("proxying to {}", backend);
                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
                return Ok(());
            }
            Err(e) => {
                warn!("backend {} unavailable: {}", backend, e);
            }
        }
    }
    bail!("no backend available")
}
