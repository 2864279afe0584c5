//! Client forwarding engine.
//!
//! Two pumps around one transport: TUN→server compresses and sends, while
//! server→TUN decrypts, decompresses, and injects. Per-packet failures are
//! logged and skipped; TUN EOF or a dead socket triggers graceful shutdown.

mod routes;

pub use routes::RouteManager;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bufpool;
use crate::compress;
use crate::crypto::MasterKey;
use crate::error::Result;
use crate::replay::DEFAULT_WINDOW_SIZE;
use crate::transport::{Incoming, TransportConfig, UdpTransport};
use crate::tun::{TunInterface, TunReader, TunWriter};
use crate::{DEFAULT_CLIENT_INNER_IP, DEFAULT_KEEPALIVE_INTERVAL, TUN_IFACE};

/// Client construction parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// VPN server endpoint.
    pub server_addr: SocketAddr,
    /// Inner address to assign to the TUN interface.
    pub inner_ip: Ipv4Addr,
    /// Whether to redirect the default route through the tunnel.
    pub auto_routes: bool,
    /// Optional SOCKS5 relay for the obfuscation hop.
    pub socks5_proxy: Option<SocketAddr>,
    /// Keep-alive period.
    pub keepalive_interval: Duration,
    /// Anti-replay window width.
    pub replay_window: u32,
}

impl ClientConfig {
    /// Defaults for everything except the server endpoint.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            inner_ip: DEFAULT_CLIENT_INNER_IP,
            auto_routes: true,
            socks5_proxy: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            replay_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// A connected VPN client.
pub struct VpnClient {
    transport: Arc<UdpTransport>,
    routes: Option<RouteManager>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl VpnClient {
    /// Bring up the TUN interface and transport, configure routes, and
    /// start the pumps.
    pub async fn connect(key: MasterKey, config: ClientConfig) -> Result<Self> {
        let tun = TunInterface::create(TUN_IFACE, config.inner_ip)?;

        if let Some(proxy) = config.socks5_proxy {
            info!(server = %config.server_addr, relay = %proxy, "connecting via SOCKS5 relay");
        }

        let transport = UdpTransport::bind(
            &key,
            TransportConfig {
                local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                remote_addr: Some(config.server_addr),
                socks5_proxy: config.socks5_proxy,
                keepalive_interval: config.keepalive_interval,
                replay_window: config.replay_window,
            },
        )
        .await?;

        info!(server = %config.server_addr, device = tun.name(), "connected to VPN server");

        let routes = if config.auto_routes {
            let mut routes = RouteManager::new(TUN_IFACE, config.server_addr.ip());
            match routes.setup().await {
                Ok(()) => info!("routes configured: all traffic now goes through the VPN"),
                Err(err) => {
                    warn!(error = %err, "route setup failed; configure routes manually");
                }
            }
            Some(routes)
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let (tun_reader, tun_writer) = tun.into_split();
        let workers = vec![
            tokio::spawn(tun_to_server(
                tun_reader,
                Arc::clone(&transport),
                shutdown.subscribe(),
                shutdown.clone(),
            )),
            tokio::spawn(server_to_tun(
                tun_writer,
                Arc::clone(&transport),
                shutdown.subscribe(),
                shutdown.clone(),
            )),
        ];

        Ok(Self {
            transport,
            routes,
            shutdown,
            workers,
        })
    }

    /// Wait until a fatal condition stops the engine.
    pub async fn wait(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        let _ = shutdown.changed().await;
    }

    /// Stop the pumps, restore routes, and close the transport.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        self.transport.close();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        if let Some(routes) = &mut self.routes {
            routes.restore().await;
        }
        info!("disconnected from VPN server");
    }
}

/// TUN → server pump: read, compress, seal, send.
async fn tun_to_server(
    mut tun: TunReader,
    transport: Arc<UdpTransport>,
    mut shutdown: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
) {
    let mut buf = bufpool::PACKET_POOL.acquire();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = tun.read_packet(&mut buf[..]) => {
                let n = match read {
                    Ok(0) => {
                        warn!("TUN device closed (EOF)");
                        let _ = stop.send(true);
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        warn!(error = %err, "TUN read failed");
                        let _ = stop.send(true);
                        break;
                    }
                };

                let (payload, compressed) = match compress::compress(&buf[..n]) {
                    Ok(compressed) => compressed,
                    Err(err) => {
                        warn!(error = %err, "compression failed, dropping packet");
                        continue;
                    }
                };

                debug!(bytes = n, compressed, "tunneling packet to server");
                if let Err(err) = transport.send(&payload, compressed).await {
                    if err.is_fatal() {
                        warn!(error = %err, "transport send failed");
                        let _ = stop.send(true);
                        break;
                    }
                    debug!(error = %err, "packet not sent");
                }
            }
        }
    }
    debug!("tun→server pump stopped");
}

/// Server → TUN pump: receive, decompress, inject.
async fn server_to_tun(
    mut tun: TunWriter,
    transport: Arc<UdpTransport>,
    mut shutdown: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.recv() => match received {
                Ok(Incoming::Data { payload, compressed, .. }) => {
                    let packet = match compress::decompress(&payload, compressed) {
                        Ok(packet) => packet,
                        Err(err) => {
                            warn!(error = %err, "bad payload from server");
                            continue;
                        }
                    };
                    debug!(bytes = packet.len(), "injecting packet from server");
                    if let Err(err) = tun.write_packet(&packet).await {
                        warn!(error = %err, "TUN write failed");
                        let _ = stop.send(true);
                        break;
                    }
                }
                Ok(Incoming::Control { .. }) => {}
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, "transport closed");
                    let _ = stop.send(true);
                    break;
                }
                Err(err) => debug!(error = %err, "datagram dropped"),
            }
        }
    }
    debug!("server→tun pump stopped");
}
