//! Size-classed buffer pools for the packet path.
//!
//! Both pump directions read into full-size buffers on every iteration;
//! pooling them keeps the hot path free of per-packet allocation. A pool
//! hands out an RAII guard that returns its buffer on drop, so a buffer can
//! never be referenced after release. The 6-byte record header and 12-byte
//! nonce classes are stack arrays and need no pooling.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

use crate::TUN_MTU;

/// Largest datagram the transport ever reads: an MTU-sized record plus the
/// SOCKS5 envelope (which may carry a domain-form address), rounded up.
pub const RECORD_BUF_SIZE: usize = 2048;

/// Free-list bound per pool; buffers beyond this are dropped on release.
const MAX_POOLED: usize = 64;

/// Pool for inner IP packets read from the TUN device.
pub static PACKET_POOL: BufferPool = BufferPool::new(TUN_MTU);

/// Pool for raw datagrams read from the UDP socket.
pub static RECORD_POOL: BufferPool = BufferPool::new(RECORD_BUF_SIZE);

/// A bounded free list of fixed-size byte buffers.
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool whose buffers are `size` bytes long.
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer from the pool, allocating one if the free list is empty.
    pub fn acquire(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf { pool: self, buf }
    }

    /// Buffer length this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Buffers currently idle on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

/// A buffer borrowed from a pool, returned on drop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
