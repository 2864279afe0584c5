//! Server forwarding engine.
//!
//! Bridges the TUN device with every known peer over one transport. Two
//! pumps plus one janitor:
//!
//! - *TUN → peers*: each inner packet is compressed once, then sealed and
//!   sent to every peer in a directory snapshot, each send under its own
//!   fresh sequence number.
//! - *Peers → TUN*: datagrams are authenticated and decrypted by the
//!   transport; a previously unseen source becomes a peer on its first
//!   authenticated record.
//! - *Eviction*: peers silent for three keep-alive intervals are dropped,
//!   along with their replay state, to bound the directory.
//!
//! Per-packet failures never stop the server's loops.

mod network;
mod peer;

pub use network::NetworkManager;
pub use peer::{Peer, PeerDirectory};

use std::net::SocketAddr;
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
use crate::{DEFAULT_KEEPALIVE_INTERVAL, SERVER_INNER_IP, TUN_IFACE};

/// Idle multiple of the keep-alive interval after which a peer is evicted.
const IDLE_EVICTION_FACTOR: u32 = 3;

/// Server construction parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP endpoint to listen on.
    pub listen_addr: SocketAddr,
    /// Keep-alive period; also paces idle eviction.
    pub keepalive_interval: Duration,
    /// Anti-replay window width, per peer.
    pub replay_window: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            replay_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// A running VPN server.
pub struct VpnServer {
    transport: Arc<UdpTransport>,
    peers: Arc<PeerDirectory>,
    network: NetworkManager,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl VpnServer {
    /// Bring up the TUN device, host networking, and the transport, then
    /// start the forwarding loops.
    pub async fn start(key: MasterKey, config: ServerConfig) -> Result<Self> {
        let tun = TunInterface::create(TUN_IFACE, SERVER_INNER_IP)?;

        let mut network = NetworkManager::detect().await?;
        network.setup().await?;

        let transport = match UdpTransport::bind(
            &key,
            TransportConfig {
                local_addr: config.listen_addr,
                remote_addr: None,
                socks5_proxy: None,
                keepalive_interval: config.keepalive_interval,
                replay_window: config.replay_window,
            },
        )
        .await
        {
            Ok(transport) => transport,
            Err(err) => {
                network.cleanup().await;
                return Err(err);
            }
        };

        info!(listen = %config.listen_addr, device = tun.name(), "VPN server listening");

        let peers = Arc::new(PeerDirectory::new());
        let (shutdown, _) = watch::channel(false);
        let (tun_reader, tun_writer) = tun.into_split();

        let mut workers = vec![
            tokio::spawn(tun_to_peers(
                tun_reader,
                Arc::clone(&transport),
                Arc::clone(&peers),
                shutdown.subscribe(),
            )),
            tokio::spawn(peers_to_tun(
                tun_writer,
                Arc::clone(&transport),
                Arc::clone(&peers),
                shutdown.subscribe(),
            )),
        ];
        if !config.keepalive_interval.is_zero() {
            workers.push(tokio::spawn(evict_idle_peers(
                Arc::clone(&transport),
                Arc::clone(&peers),
                config.keepalive_interval,
                shutdown.subscribe(),
            )));
        }

        Ok(Self {
            transport,
            peers,
            network,
            shutdown,
            workers,
        })
    }

    /// Number of currently known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Stop the loops, close the transport, and restore host networking.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.transport.close();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.network.cleanup().await;
        info!("server stopped");
    }
}

/// TUN → peers pump: read one inner packet and fan it out.
async fn tun_to_peers(
    mut tun: TunReader,
    transport: Arc<UdpTransport>,
    peers: Arc<PeerDirectory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = bufpool::PACKET_POOL.acquire();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = tun.read_packet(&mut buf[..]) => {
                let n = match read {
                    Ok(0) => {
                        warn!("TUN device closed (EOF)");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        warn!(error = %err, "TUN read failed");
                        continue;
                    }
                };

                let snapshot = peers.snapshot();
                if snapshot.is_empty() {
                    debug!(bytes = n, "no peers connected, dropping packet");
                    continue;
                }

                let (payload, compressed) = match compress::compress(&buf[..n]) {
                    Ok(compressed) => compressed,
                    Err(err) => {
                        warn!(error = %err, "compression failed, dropping packet");
                        continue;
                    }
                };

                debug!(bytes = n, peers = snapshot.len(), "fanning out packet");
                for peer in snapshot {
                    match transport.send_to(&payload, compressed, peer.addr()).await {
                        Ok(()) => peer.record_out(),
                        Err(err) => {
                            debug!(peer = %peer.addr(), error = %err, "send to peer failed");
                        }
                    }
                }
            }
        }
    }
    debug!("tun→peers pump stopped");
}

/// Peers → TUN pump: authenticate, register, decompress, inject.
async fn peers_to_tun(
    mut tun: TunWriter,
    transport: Arc<UdpTransport>,
    peers: Arc<PeerDirectory>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.recv() => match received {
                Ok(Incoming::Data { payload, compressed, from }) => {
                    let (peer, new) = peers.register(from);
                    if new {
                        info!(peer = %from, "new peer connected");
                    }
                    peer.touch();
                    peer.record_in();

                    let packet = match compress::decompress(&payload, compressed) {
                        Ok(packet) => packet,
                        Err(err) => {
                            warn!(peer = %from, error = %err, "bad payload from peer");
                            continue;
                        }
                    };

                    if let Err(err) = tun.write_packet(&packet).await {
                        warn!(error = %err, "TUN write failed");
                    }
                }
                Ok(Incoming::Control { from }) => {
                    // Keep-alives refresh liveness but never create peers:
                    // only an authenticated record can do that.
                    if let Some(peer) = peers.get(&from) {
                        peer.touch();
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, "transport closed");
                    break;
                }
                Err(err) if err.is_replay() => {
                    debug!(error = %err, "replayed datagram dropped");
                }
                Err(err) => debug!(error = %err, "datagram dropped"),
            }
        }
    }
    debug!("peers→tun pump stopped");
}

/// Drop peers that have gone silent, together with their replay state.
async fn evict_idle_peers(
    transport: Arc<UdpTransport>,
    peers: Arc<PeerDirectory>,
    keepalive_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_idle = keepalive_interval * IDLE_EVICTION_FACTOR;
    let mut ticker = tokio::time::interval(keepalive_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                for peer in peers.evict_idle(max_idle) {
                    transport.forget_peer(&peer.addr());
                    let (received, sent) = peer.traffic();
                    info!(
                        peer = %peer.addr(),
                        received,
                        sent,
                        "idle peer evicted"
                    );
                }
            }
        }
    }
    debug!("eviction task stopped");
}
