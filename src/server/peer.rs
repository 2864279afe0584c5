//! Peer directory for the fan-out engine.
//!
//! Peers exist from their first authenticated datagram until shutdown or
//! idle eviction. The directory never holds back-references to the engine;
//! entries carry only the endpoint and bookkeeping.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// One known remote peer, keyed by its public endpoint.
pub struct Peer {
    addr: SocketAddr,
    last_seen: Mutex<Instant>,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Mutex::new(Instant::now()),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
        }
    }

    /// The peer's public endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Count one datagram received from this peer.
    pub fn record_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one datagram sent to this peer.
    pub fn record_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Lifetime `(received, sent)` datagram counts.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.packets_in.load(Ordering::Relaxed),
            self.packets_out.load(Ordering::Relaxed),
        )
    }
}

/// Concurrent peer directory: shared reads for fan-out, exclusive
/// insertion. Emission iterates a snapshot of `Arc` handles, so a slow send
/// never serializes against the insertion of a new peer.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
}

impl PeerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing peer.
    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(addr).cloned()
    }

    /// Insert a peer if absent. Returns the entry and whether it was new.
    pub fn register(&self, addr: SocketAddr) -> (Arc<Peer>, bool) {
        if let Some(peer) = self.peers.read().get(&addr) {
            return (Arc::clone(peer), false);
        }
        match self.peers.write().entry(addr) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let peer = Arc::new(Peer::new(addr));
                entry.insert(Arc::clone(&peer));
                (peer, true)
            }
        }
    }

    /// Clone the current peer set for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Remove and return peers idle for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.write();
        let expired: Vec<SocketAddr> = peers
            .values()
            .filter(|peer| peer.idle_for() > max_idle)
            .map(|peer| peer.addr())
            .collect();
        expired
            .into_iter()
            .filter_map(|addr| peers.remove(&addr))
            .collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
