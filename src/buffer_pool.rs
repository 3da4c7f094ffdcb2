//! Pooled byte buffers for payload assembly.
//!
//! `BufferPool` is the allocator surface the serialization paths write
//! into. Buffers return to the pool when dropped, so release happens
//! exactly once no matter which path (wire write, user handoff, error)
//! consumes the buffer.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

use crate::codec::MAX_FRAME_SIZE;

/// Buffers are sized to hold the largest legal frame body.
const BUFFER_CAPACITY: usize = MAX_FRAME_SIZE;

/// Number of buffers retained by the pool.
const POOL_CAPACITY: usize = 64;

/// Thread-safe pool of frame-sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            pool: Arc::new(Pool::new(POOL_CAPACITY, || {
                Vec::with_capacity(BUFFER_CAPACITY)
            })),
        }
    }

    /// Take an empty buffer from the pool, allocating if the pool is dry.
    pub fn get(&self) -> PooledBuf {
        let mut buf = self
            .pool
            .pull_owned(|| Vec::with_capacity(BUFFER_CAPACITY));
        // Buffers come back in whatever state they were dropped.
        buf.clear();
        PooledBuf { inner: buf }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").finish_non_exhaustive()
    }
}

/// A buffer checked out of a [`BufferPool`]. Returns to the pool on drop.
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .finish()
    }
}
