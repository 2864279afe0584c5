//! veiltun client binary.
//!
//! Brings up a local `myvpn0`, tunnels all host traffic to the server, and
//! optionally hides the UDP stream behind a SOCKS5 UDP-Associate relay.
//! Needs root (TUN creation, route changes).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use veiltun::client::{ClientConfig, VpnClient};
use veiltun::crypto::MasterKey;

#[derive(Parser, Debug)]
#[command(name = "veiltun-client", version, about = "VPN client: tunnels all traffic through the server")]
struct Args {
    /// VPN server endpoint (e.g. 192.0.2.10:8080)
    #[arg(long)]
    server: String,

    /// Encryption key file (32 raw bytes or 64 hex chars)
    #[arg(long)]
    key: PathBuf,

    /// Inner address for the TUN interface
    #[arg(long, default_value_t = veiltun::DEFAULT_CLIENT_INNER_IP)]
    ip: Ipv4Addr,

    /// Redirect the default route through the tunnel
    #[arg(long = "auto-routes", default_value_t = true, action = clap::ArgAction::Set)]
    auto_routes: bool,

    /// SOCKS5 relay endpoint for the obfuscation hop (e.g. 127.0.0.1:1080)
    #[arg(long)]
    socks5: Option<String>,

    /// Log every packet
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let key = MasterKey::load(&args.key)?;
    let server_addr = veiltun::resolve_endpoint(&args.server)?;
    let socks5_proxy = args
        .socks5
        .as_deref()
        .map(veiltun::resolve_endpoint)
        .transpose()?;

    let mut client = VpnClient::connect(
        key,
        ClientConfig {
            inner_ip: args.ip,
            auto_routes: args.auto_routes,
            socks5_proxy,
            ..ClientConfig::new(server_addr)
        },
    )
    .await?;

    tracing::info!("VPN client started; press Ctrl+C to stop");
    tokio::select! {
        _ = wait_for_signal() => tracing::info!("shutting down client"),
        _ = client.wait() => tracing::warn!("connection ended"),
    }

    client.shutdown().await;
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
