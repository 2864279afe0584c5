//! UDP transport: framing, sequencing, keep-alive, and the optional SOCKS5
//! envelope.
//!
//! One transport owns one UDP socket. Outbound payloads are framed as
//! sealed records (see [`crate::wire`]) under a shared, mutex-protected
//! sequence counter; inbound datagrams are demultiplexed into data,
//! keep-alive, and keep-alive-ack frames. Replay state is tracked per
//! source endpoint so one peer's stream can never mask another's.
//!
//! ## Lifecycle
//!
//! ```text
//! Fresh ──(SOCKS5 negotiated)──▶ Associated ──(remote known)──▶ Active
//!                                                                 │
//!                                  Closed ◀── Closing ◀───────────┘
//! ```
//!
//! Close is idempotent. A server-side transport starts with no remote and
//! latches the source of the first well-formed datagram so keep-alives have
//! somewhere to go.

mod socks5;

pub use socks5::SocksAssociation;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bufpool;
use crate::crypto::{MasterKey, PacketCipher};
use crate::error::{Error, Result};
use crate::replay::{ReplayWindow, DEFAULT_WINDOW_SIZE};
use crate::wire::{self, Frame, Header, PacketType};
use crate::DEFAULT_KEEPALIVE_INTERVAL;

/// Socket send/receive buffer size (4 MiB).
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Transport construction parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local endpoint to bind (port 0 for ephemeral).
    pub local_addr: SocketAddr,
    /// Fixed remote endpoint, if known up front (client side).
    pub remote_addr: Option<SocketAddr>,
    /// SOCKS5 relay to negotiate a UDP association with, if any.
    pub socks5_proxy: Option<SocketAddr>,
    /// Keep-alive period; zero disables the keep-alive task.
    pub keepalive_interval: Duration,
    /// Anti-replay window width (0 selects the default).
    pub replay_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            remote_addr: None,
            socks5_proxy: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            replay_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Transport lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Bound, no association, no remote
    Fresh,
    /// SOCKS5 association established, no remote traffic yet
    Associated,
    /// Remote endpoint known, traffic flowing
    Active,
    /// Close in progress
    Closing,
    /// Closed; send and recv will fail
    Closed,
}

/// Per-datagram outcome counters, read for periodic logging.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Datagrams handed to the socket
    pub datagrams_sent: AtomicU64,
    /// Datagrams read off the socket
    pub datagrams_received: AtomicU64,
    /// Records dropped for AEAD failure
    pub auth_failures: AtomicU64,
    /// Records dropped by the replay window
    pub replay_drops: AtomicU64,
    /// Datagrams dropped as malformed
    pub malformed: AtomicU64,
}

/// One received datagram, as surfaced to the forwarding engines.
#[derive(Debug)]
pub enum Incoming {
    /// An authenticated, decrypted DATA payload.
    Data {
        /// Decrypted payload (still LZ4-framed when `compressed`)
        payload: Vec<u8>,
        /// Compressed flag from the record header
        compressed: bool,
        /// Source endpoint (rewritten to the VPN server under SOCKS5)
        from: SocketAddr,
    },
    /// Keep-alive traffic, handled internally; no payload for the caller.
    Control {
        /// Source endpoint of the control frame
        from: SocketAddr,
    },
}

/// An AEAD-framed UDP transport with keep-alive and anti-replay.
pub struct UdpTransport {
    socket: UdpSocket,
    cipher: PacketCipher,
    sequence: Mutex<u32>,
    remote: RwLock<Option<SocketAddr>>,
    socks: Option<SocksAssociation>,
    windows: RwLock<HashMap<SocketAddr, Mutex<ReplayWindow>>>,
    window_size: u32,
    state: Mutex<TransportState>,
    shutdown: watch::Sender<bool>,
    /// Per-datagram outcome counters.
    pub stats: TransportStats,
}

impl UdpTransport {
    /// Bind a transport and, when configured, negotiate the SOCKS5
    /// association and start the keep-alive task.
    pub async fn bind(key: &MasterKey, config: TransportConfig) -> Result<Arc<Self>> {
        let socket = tune_socket(config.local_addr)?;

        let socks = match config.socks5_proxy {
            Some(proxy) => {
                let target = config.remote_addr.ok_or_else(|| {
                    Error::transport_init("SOCKS5 requires a remote endpoint")
                })?;
                Some(SocksAssociation::establish(proxy, target).await?)
            }
            None => None,
        };

        let state = match (&socks, config.remote_addr) {
            (_, Some(_)) => TransportState::Active,
            (Some(_), None) => TransportState::Associated,
            (None, None) => TransportState::Fresh,
        };

        let (shutdown, _) = watch::channel(false);
        let transport = Arc::new(Self {
            socket,
            cipher: PacketCipher::new(key),
            sequence: Mutex::new(0),
            remote: RwLock::new(config.remote_addr),
            socks,
            windows: RwLock::new(HashMap::new()),
            window_size: config.replay_window,
            state: Mutex::new(state),
            shutdown,
            stats: TransportStats::default(),
        });

        if !config.keepalive_interval.is_zero() {
            tokio::spawn(keepalive_loop(
                Arc::clone(&transport),
                config.keepalive_interval,
            ));
        }

        debug!(local = %transport.local_addr()?, "transport bound");
        Ok(transport)
    }

    /// Local endpoint the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Remote endpoint, once known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// Largest plaintext accepted by [`send`](Self::send).
    pub fn max_payload(&self) -> usize {
        wire::max_payload(self.socks.is_some())
    }

    /// Seal and send a payload to the configured remote endpoint.
    pub async fn send(&self, payload: &[u8], compressed: bool) -> Result<()> {
        let remote = self
            .remote_addr()
            .ok_or_else(|| Error::packet("remote endpoint not set"))?;
        self.send_to(payload, compressed, remote).await
    }

    /// Seal and send a payload to an explicit destination (server fan-out).
    pub async fn send_to(&self, payload: &[u8], compressed: bool, dst: SocketAddr) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::packet(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                self.max_payload()
            )));
        }

        let header = Header {
            sequence: self.next_sequence(),
            compressed,
        }
        .encode();
        let record = self.cipher.seal(payload, &header)?;

        let mut datagram = BytesMut::with_capacity(wire::HEADER_SIZE + record.len());
        datagram.put_slice(&header);
        datagram.put_slice(&record);
        self.emit(&datagram, dst).await
    }

    /// Receive one datagram.
    ///
    /// Keep-alive probes are answered and keep-alive echoes swallowed, both
    /// surfacing as [`Incoming::Control`]; DATA records come back decrypted.
    /// Malformed, replayed, and unauthentic datagrams return non-fatal
    /// errors; the transport stays usable after any of them.
    pub async fn recv(&self) -> Result<Incoming> {
        let mut buf = bufpool::RECORD_POOL.acquire();
        let (len, src) = self.socket.recv_from(&mut buf[..]).await?;
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let result = self.demux(&buf[..len], src).await;
        if let Err(err) = &result {
            match err {
                Error::Crypto => {
                    self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                }
                Error::Replay(_) | Error::TooOld(_) => {
                    self.stats.replay_drops.fetch_add(1, Ordering::Relaxed);
                }
                Error::Packet(_) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        result
    }

    /// Drop replay state for an evicted peer.
    pub fn forget_peer(&self, src: &SocketAddr) {
        self.windows.write().remove(src);
    }

    /// Close the transport. Idempotent; stops the keep-alive task and drops
    /// the SOCKS5 control stream.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, TransportState::Closing | TransportState::Closed) {
                return;
            }
            *state = TransportState::Closing;
        }

        let _ = self.shutdown.send(true);
        if let Some(socks) = &self.socks {
            socks.close();
        }

        *self.state.lock() = TransportState::Closed;
        info!(
            sent = self.stats.datagrams_sent.load(Ordering::Relaxed),
            received = self.stats.datagrams_received.load(Ordering::Relaxed),
            auth_failures = self.stats.auth_failures.load(Ordering::Relaxed),
            replay_drops = self.stats.replay_drops.load(Ordering::Relaxed),
            malformed = self.stats.malformed.load(Ordering::Relaxed),
            "transport closed"
        );
    }

    async fn demux(&self, datagram: &[u8], src: SocketAddr) -> Result<Incoming> {
        let (payload, src) = match &self.socks {
            Some(socks) => {
                let offset = SocksAssociation::strip(datagram)?;
                // The relay is the wire-level source; the logical source is
                // the VPN server the association addresses.
                (&datagram[offset..], socks.target())
            }
            None => (datagram, src),
        };

        let frame = Frame::parse(payload)?;
        self.latch_remote(src);

        match frame {
            Frame::Keepalive { sequence } => {
                let echo = wire::encode_control(PacketType::KeepaliveAck, sequence);
                self.emit(&echo, src).await?;
                debug!(%src, sequence, "answered keep-alive");
                Ok(Incoming::Control { from: src })
            }
            Frame::KeepaliveAck { sequence } => {
                debug!(%src, sequence, "keep-alive acknowledged");
                Ok(Incoming::Control { from: src })
            }
            Frame::Data { header, record } => {
                self.check_replay(src, header.sequence)?;
                let payload = self.cipher.open(record, &header.encode())?;
                Ok(Incoming::Data {
                    payload,
                    compressed: header.compressed,
                    from: src,
                })
            }
        }
    }

    /// Send a raw frame, through the SOCKS5 envelope when configured.
    async fn emit(&self, frame: &[u8], dst: SocketAddr) -> Result<()> {
        match &self.socks {
            Some(socks) => {
                let wrapped = socks.wrap(frame);
                self.socket.send_to(&wrapped, socks.relay()).await?;
            }
            None => {
                self.socket.send_to(frame, dst).await?;
            }
        }
        self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn next_sequence(&self) -> u32 {
        let mut sequence = self.sequence.lock();
        let assigned = *sequence;
        *sequence = sequence.wrapping_add(1);
        assigned
    }

    /// Remember the first well-formed source as our remote (server side).
    fn latch_remote(&self, src: SocketAddr) {
        {
            let mut remote = self.remote.write();
            if remote.is_some() {
                return;
            }
            *remote = Some(src);
        }
        let mut state = self.state.lock();
        if matches!(*state, TransportState::Fresh | TransportState::Associated) {
            *state = TransportState::Active;
        }
        info!(%src, "remote endpoint latched");
    }

    fn check_replay(&self, src: SocketAddr, sequence: u32) -> Result<()> {
        {
            let windows = self.windows.read();
            if let Some(window) = windows.get(&src) {
                return window.lock().accept(sequence);
            }
        }
        self.windows
            .write()
            .entry(src)
            .or_insert_with(|| Mutex::new(ReplayWindow::new(self.window_size)))
            .get_mut()
            .accept(sequence)
    }
}

/// Periodic keep-alive sender.
///
/// Ticks from construction but stays silent until a remote endpoint is
/// known, which covers both the client (remote set up front) and the server
/// (remote latched from traffic). Stops when the transport closes.
async fn keepalive_loop(transport: Arc<UdpTransport>, interval: Duration) {
    let mut shutdown = transport.shutdown.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(remote) = transport.remote_addr() else { continue };
                let frame = wire::encode_control(
                    PacketType::Keepalive,
                    transport.next_sequence(),
                );
                if let Err(err) = transport.emit(&frame, remote).await {
                    debug!(error = %err, "keep-alive send failed");
                }
            }
        }
    }
    debug!("keep-alive task stopped");
}

/// Create and tune the UDP socket: large buffers for burst absorption,
/// address reuse where the platform supports it.
fn tune_socket(local: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::transport_init(format!("socket create failed: {e}")))?;

    let _ = socket.set_reuse_address(true);
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    let _ = socket.set_reuse_port(true);

    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| Error::transport_init(format!("SO_RCVBUF: {e}")))?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| Error::transport_init(format!("SO_SNDBUF: {e}")))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::transport_init(format!("set_nonblocking: {e}")))?;
    socket
        .bind(&local.into())
        .map_err(|e| Error::transport_init(format!("bind {local} failed: {e}")))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::transport_init(format!("socket registration failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use std::collections::HashSet;

    fn test_key() -> MasterKey {
        MasterKey::from_bytes([0u8; KEY_SIZE])
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn sink() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind(loopback()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_send_requires_remote() {
        let transport = UdpTransport::bind(
            &test_key(),
            TransportConfig {
                local_addr: loopback(),
                keepalive_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(transport.state(), TransportState::Fresh);
        assert!(matches!(
            transport.send(b"hi", false).await,
            Err(Error::Packet(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (_sink, sink_addr) = sink().await;
        let transport = UdpTransport::bind(
            &test_key(),
            TransportConfig {
                local_addr: loopback(),
                remote_addr: Some(sink_addr),
                keepalive_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let too_big = vec![0u8; transport.max_payload() + 1];
        assert!(matches!(
            transport.send(&too_big, false).await,
            Err(Error::Packet(_))
        ));

        let just_right = vec![0u8; transport.max_payload()];
        assert!(transport.send(&just_right, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_share_a_sequence() {
        let (sink, sink_addr) = sink().await;
        let transport = UdpTransport::bind(
            &test_key(),
            TransportConfig {
                local_addr: loopback(),
                remote_addr: Some(sink_addr),
                keepalive_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        transport.send(b"x", false).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = HashSet::new();
        let mut buf = [0u8; 128];
        for _ in 0..100 {
            let (len, _) = sink.recv_from(&mut buf).await.unwrap();
            assert!(len > wire::HEADER_SIZE);
            let sequence = u32::from_be_bytes(buf[1..5].try_into().unwrap());
            assert!(seen.insert(sequence), "sequence {sequence} assigned twice");
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = UdpTransport::bind(
            &test_key(),
            TransportConfig {
                local_addr: loopback(),
                keepalive_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_forget_peer_resets_replay_state() {
        let (_sink, sink_addr) = sink().await;
        let transport = UdpTransport::bind(
            &test_key(),
            TransportConfig {
                local_addr: loopback(),
                keepalive_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        transport.check_replay(sink_addr, 5).unwrap();
        assert!(transport.check_replay(sink_addr, 5).is_err());

        transport.forget_peer(&sink_addr);
        assert!(transport.check_replay(sink_addr, 5).is_ok());
    }
}
