//! Move-only pixel buffers and the bulk pool snapshots are copied into.
//!
//! A [`PixelBuffer`] has exactly one owner at a time and is freed exactly once
//! when that owner drops it. Buffers drawn from a [`BufferPool`] go back to
//! the pool instead of the allocator.

use std::{
    collections::TryReserveError,
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("failed to allocate {requested} bytes")]
pub struct AllocError {
    pub requested: usize,
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
pub(crate) fn try_zeroed(len: usize) -> Result<Vec<u8>, AllocError> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_: TryReserveError| AllocError { requested: len })?;
    data.resize(len, 0);
    Ok(data)
}

/// Fallible copy of a byte slice.
pub(crate) fn try_copy(src: &[u8]) -> Result<Vec<u8>, AllocError> {
    let mut data = Vec::new();
    data.try_reserve_exact(src.len())
        .map_err(|_| AllocError {
            requested: src.len(),
        })?;
    data.extend_from_slice(src);
    Ok(data)
}

pub(crate) fn try_copy_str(src: &str) -> Result<String, AllocError> {
    let mut out = String::new();
    out.try_reserve_exact(src.len())
        .map_err(|_| AllocError {
            requested: src.len(),
        })?;
    out.push_str(src);
    Ok(out)
}

/// Uniquely owned pixel storage. Deliberately not `Clone`.
pub struct PixelBuffer {
    data: Vec<u8>,
    home: Option<Arc<PoolShared>>,
}

impl PixelBuffer {
    /// Wrap an existing allocation.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    /// Copy `src` into a fresh allocation from the default allocator.
    pub fn try_copy_from(src: &[u8]) -> Result<Self, AllocError> {
        try_copy(src).map(Self::from_vec)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the storage came from a [`BufferPool`].
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Take the bytes out. Pooled storage is not returned to its pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        if let Some(home) = self.home.take() {
            home.detached.fetch_add(1, Ordering::Relaxed);
        }
        mem::take(&mut self.data)
    }
}

impl Deref for PixelBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PixelBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.release(mem::take(&mut self.data));
        }
    }
}

struct PoolShared {
    buffer_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
    acquired: AtomicU64,
    released: AtomicU64,
    detached: AtomicU64,
    fallbacks: AtomicU64,
}

impl PoolShared {
    fn release(&self, mut data: Vec<u8>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        data.clear();
        if let Ok(mut free) = self.free.lock() {
            free.push(data);
        }
    }
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out from the pool.
    pub acquired: u64,
    /// Pooled buffers dropped and returned.
    pub released: u64,
    /// Requests served by the default allocator instead.
    pub fallbacks: u64,
    /// Buffers currently sitting in the pool.
    pub available: usize,
}

/// Preallocated bulk buffers for frame copies, standing in for the external
/// PSRAM heap. Requests the pool cannot serve fall back to the default
/// allocator.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(buffer_len: usize, count: usize) -> Result<Self, AllocError> {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            let mut data = try_zeroed(buffer_len)?;
            data.clear();
            free.push(data);
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                buffer_len,
                free: Mutex::new(free),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                detached: AtomicU64::new(0),
                fallbacks: AtomicU64::new(0),
            }),
        })
    }

    /// A zeroed buffer of `len` bytes, pooled when possible.
    pub fn acquire(&self, len: usize) -> Result<PixelBuffer, AllocError> {
        if len <= self.shared.buffer_len {
            let pooled = self.shared.free.lock().ok().and_then(|mut free| free.pop());
            if let Some(mut data) = pooled {
                data.resize(len, 0);
                self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(PixelBuffer {
                    data,
                    home: Some(self.shared.clone()),
                });
            }
        }
        self.shared.fallbacks.fetch_add(1, Ordering::Relaxed);
        try_zeroed(len).map(PixelBuffer::from_vec)
    }

    /// Copy `src` into a pooled buffer, falling back to the default allocator.
    pub fn copy_from(&self, src: &[u8]) -> Result<PixelBuffer, AllocError> {
        let mut buffer = self.acquire(src.len())?;
        buffer.copy_from_slice(src);
        Ok(buffer)
    }

    /// Pooled buffers currently owned by someone other than the pool.
    pub fn outstanding(&self) -> u64 {
        let acquired = self.shared.acquired.load(Ordering::Relaxed);
        let returned = self.shared.released.load(Ordering::Relaxed)
            + self.shared.detached.load(Ordering::Relaxed);
        acquired.saturating_sub(returned)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            fallbacks: self.shared.fallbacks.load(Ordering::Relaxed),
            available: self.shared.free.lock().map(|free| free.len()).unwrap_or(0),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }
}
