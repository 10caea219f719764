//! Lock-free buffer pool
//!
//! Reusable fixed-size byte buffers shared by all relay pumps and UDP
//! forwarders, backed by `crossbeam_queue::ArrayQueue` so concurrent
//! acquire/release never contends on a lock. Buffers return to the pool
//! when the [`PooledBuffer`] guard drops; a full pool simply drops the
//! buffer instead.
//!
//! # Example
//!
//! ```
//! use ws_router::io::BufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(BufferPool::new(64, 4096));
//! let buf = pool.get();
//! assert_eq!(buf.len(), 4096);
//! drop(buf); // returned to the pool
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Buffer size for TCP/framed relay pumps, matching the framed-connection
/// read/write buffer size.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Buffer size for UDP datagrams.
pub const UDP_BUFFER_SIZE: usize = 16 * 1024;

/// A pool of reusable fixed-size byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    /// Create a pool holding at most `capacity` buffers of `buffer_size` bytes.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Get a buffer from the pool, allocating one if the pool is empty.
    ///
    /// The buffer's length is always `buffer_size`; contents of reused
    /// buffers are stale and expected to be overwritten by the next read.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            buf.resize(self.buffer_size, 0);
            buf
        } else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn return_buffer(&self, buffer: Vec<u8>) {
        // Full pool: let the buffer drop.
        let _ = self.buffers.push(buffer);
    }

    /// Size of each buffer in bytes.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently idle in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Number of fresh allocations performed so far.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers served from the pool so far.
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Dereferences to `[u8]`; automatically returned to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}
