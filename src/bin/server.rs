//! veiltun server binary.
//!
//! Terminates the VPN subnet: brings up `myvpn0`, enables forwarding and
//! NAT, and bridges the interface with every authenticated peer over UDP.
//! Needs root (TUN creation, sysctl, iptables).

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use veiltun::crypto::MasterKey;
use veiltun::server::{ServerConfig, VpnServer};

#[derive(Parser, Debug)]
#[command(name = "veiltun-server", version, about = "VPN server: terminates myvpn0 and bridges remote peers")]
struct Args {
    /// UDP endpoint to listen on (":8080" binds all interfaces)
    #[arg(long, default_value = ":8080")]
    addr: String,

    /// Encryption key file (32 raw bytes or 64 hex chars); a random key is
    /// generated and printed when absent
    #[arg(long)]
    key: Option<PathBuf>,

    /// Log every packet
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let key = match &args.key {
        Some(path) => MasterKey::load(path)?,
        None => {
            let key = MasterKey::generate();
            tracing::info!("generated random encryption key; save it for client configuration");
            tracing::info!("key (hex): {}", key.to_hex());
            key
        }
    };

    let listen_addr = veiltun::resolve_endpoint(&args.addr)?;
    let mut server = VpnServer::start(
        key,
        ServerConfig {
            listen_addr,
            ..Default::default()
        },
    )
    .await?;

    tracing::info!("VPN server started; press Ctrl+C to stop");
    wait_for_signal().await;

    tracing::info!("shutting down server");
    server.stop().await;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "info,veiltun=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
