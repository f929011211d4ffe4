//! Packet buffers and the buffer pool
//!
//! UDP receive loops obtain buffers from a [`BufferPool`] backed by a
//! lock-free `crossbeam_queue::ArrayQueue`. A [`Buffer`] returns to its
//! pool when dropped, so "release" is simply ownership ending.
//!
//! Two ownership regimes share this type:
//!
//! - **Pooled**: a receive loop keeps one `Buffer` alive and calls
//!   [`Buffer::reset`] before each receive. Handlers see `&mut Buffer`
//!   and cannot retain it past return.
//! - **Per-packet**: a fresh `Buffer` per datagram. A handler that wants
//!   to keep the data calls [`Buffer::take`], after which the original
//!   is hollow and its drop is a no-op.
//!
//! The pool's `in_flight` counter is the accounting hook: after an
//! inbound closes, `in_flight` must return to zero.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Maximum UDP payload, the size of every pooled buffer
pub const UDP_BUFFER_SIZE: usize = 65535;

/// Default number of buffers kept by a pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Statistics for a buffer pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// New buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Buffer reuses from the pool
    reuses: AtomicU64,
    /// Buffers returned to the pool
    returns: AtomicU64,
    /// Buffers dropped because the pool was full
    drops: AtomicU64,
    /// Buffers currently checked out
    in_flight: AtomicU64,
}

impl PoolStats {
    /// Number of fresh allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of reuses from the pool
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of buffers returned to the pool
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Number of buffers dropped because the pool was full
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Number of buffers currently checked out of the pool
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// A pool of fixed-size receive buffers.
///
/// `get` pops a recycled buffer or allocates a new one; dropping the
/// returned [`Buffer`] pushes it back (or frees it when the pool is
/// full). Buffers are not zeroed on reuse: the receive syscall
/// overwrites the data and [`Buffer::len`] bounds what is readable.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` buffers of `buffer_size` bytes
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            stats: PoolStats::default(),
        }
    }

    /// Create a pool with default capacity and UDP-sized buffers
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, UDP_BUFFER_SIZE)
    }

    /// Check a buffer out of the pool, allocating if the pool is empty
    #[must_use]
    pub fn get(self: &Arc<Self>) -> Buffer {
        let data = if let Some(data) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            data
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Buffer {
            data: Some(data),
            len: 0,
            pool: Some(Arc::clone(self)),
        }
    }

    fn return_buffer(&self, data: Vec<u8>) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        match self.buffers.push(data) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_discarded) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Size of each buffer in bytes
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently resting in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// A length-delimited receive buffer.
///
/// The backing storage always spans the full pool buffer size;
/// `len` tracks how much of it holds valid packet data.
#[derive(Debug)]
pub struct Buffer {
    /// Backing storage; `None` after `take` or drop
    data: Option<Vec<u8>>,
    /// Valid data length
    len: usize,
    /// Owning pool; `None` for hollow buffers
    pool: Option<Arc<BufferPool>>,
}

impl Buffer {
    /// Allocate a standalone buffer not tied to any pool.
    ///
    /// Used by tests and by producers that build reply payloads.
    #[must_use]
    pub fn with_capacity(size: usize) -> Self {
        Self {
            data: Some(vec![0u8; size]),
            len: 0,
            pool: None,
        }
    }

    /// Build a standalone buffer holding a copy of `data`
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: Some(data.to_vec()),
            len: data.len(),
            pool: None,
        }
    }

    /// Discard any held data, readying the buffer for the next receive
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Set the valid data length after a receive
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffer capacity.
    pub fn truncate(&mut self, n: usize) {
        assert!(
            n <= self.capacity(),
            "length {n} exceeds buffer capacity {}",
            self.capacity()
        );
        self.len = n;
    }

    /// Full writable region for a receive syscall
    pub fn free_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Valid data length
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity of the backing storage
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// Transfer the contents (and pool accountability) out of this
    /// buffer, leaving it hollow. The hollow original's drop is a no-op.
    #[must_use]
    pub fn take(&mut self) -> Buffer {
        Buffer {
            data: self.data.take(),
            len: std::mem::take(&mut self.len),
            pool: self.pool.take(),
        }
    }

    /// Explicitly release the buffer back to its pool.
    ///
    /// Equivalent to dropping; named for call sites where the release
    /// is the point.
    pub fn release(self) {}

    /// Freeze the valid data into `bytes::Bytes`, consuming the buffer.
    ///
    /// Pooled storage is returned to the pool and the data copied;
    /// standalone storage is transferred without copying.
    #[must_use]
    pub fn freeze(mut self) -> bytes::Bytes {
        match self.pool.take() {
            Some(pool) => {
                let data = self.data.take().unwrap_or_default();
                let frozen = bytes::Bytes::copy_from_slice(&data[..self.len]);
                pool.return_buffer(data);
                frozen
            }
            None => {
                let mut data = self.data.take().unwrap_or_default();
                data.truncate(self.len);
                bytes::Bytes::from(data)
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.take()) {
            pool.return_buffer(data);
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().map_or(&[], |d| &d[..self.len])
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let len = self.len;
        self.data.as_deref_mut().map_or(&mut [], |d| &mut d[..len])
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}
