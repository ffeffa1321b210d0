// CUDA memory pool: caching allocator for device buffers
//
// Blob reshapes drop and re-create their device buffers, usually at the same
// size. Instead of returning memory to the driver, a dropped `CudaBuffer`
// hands its slice back here; the next allocation of the same dtype and
// element count pops it from the free list and zeroes it.
//
//   let stats = device.pool_stats();   // hits, misses, cached bytes
//   device.empty_cache();              // free cached slices to the driver

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{CudaSlice, DeviceSlice, DriverError};

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently held in the cache (not owned by any buffer).
    pub cached_bytes: usize,
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to the driver.
    pub misses: u64,
}

/// Per-dtype free lists: element count -> stack of free slices.
struct TypedPool<T> {
    buckets: Mutex<HashMap<usize, Vec<CudaSlice<T>>>>,
}

impl<T> TypedPool<T> {
    fn new() -> Self {
        TypedPool {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    // A panic while holding the lock leaves the map itself consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Vec<CudaSlice<T>>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_pop(&self, n: usize) -> Option<CudaSlice<T>> {
        self.lock().get_mut(&n).and_then(|stack| stack.pop())
    }

    fn push(&self, slice: CudaSlice<T>)
    where
        CudaSlice<T>: DeviceSlice<T>,
    {
        let n = slice.len();
        self.lock().entry(n).or_default().push(slice);
    }

    fn drain(&self) {
        self.lock().clear();
    }

    /// (buffers, elements) currently cached.
    fn stats(&self) -> (usize, usize) {
        self.lock()
            .iter()
            .fold((0, 0), |(c, e), (n, stack)| (c + stack.len(), e + n * stack.len()))
    }
}

/// A caching allocator for f32 and f64 device slices.
pub struct CudaMemPool {
    pool_f32: TypedPool<f32>,
    pool_f64: TypedPool<f64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CudaMemPool {
    pub fn new() -> Self {
        CudaMemPool {
            pool_f32: TypedPool::new(),
            pool_f64: TypedPool::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocate `n` zeroed f32 elements, reusing a cached slice of exactly
    /// that length if one is available.
    pub fn alloc_zeros_f32(
        &self,
        dev: &Arc<cudarc::driver::CudaDevice>,
        n: usize,
    ) -> std::result::Result<CudaSlice<f32>, DriverError> {
        if let Some(mut buf) = self.pool_f32.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            dev.memset_zeros(&mut buf)?;
            Ok(buf)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            dev.alloc_zeros::<f32>(n)
        }
    }

    pub fn alloc_zeros_f64(
        &self,
        dev: &Arc<cudarc::driver::CudaDevice>,
        n: usize,
    ) -> std::result::Result<CudaSlice<f64>, DriverError> {
        if let Some(mut buf) = self.pool_f64.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            dev.memset_zeros(&mut buf)?;
            Ok(buf)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            dev.alloc_zeros::<f64>(n)
        }
    }

    /// Return a slice to the cache.
    pub fn reclaim_f32(&self, slice: CudaSlice<f32>) {
        self.pool_f32.push(slice);
    }

    pub fn reclaim_f64(&self, slice: CudaSlice<f64>) {
        self.pool_f64.push(slice);
    }

    /// Free every cached slice to the driver.
    pub fn empty_cache(&self) {
        self.pool_f32.drain();
        self.pool_f64.drain();
    }

    pub fn stats(&self) -> PoolStats {
        let (c32, e32) = self.pool_f32.stats();
        let (c64, e64) = self.pool_f64.stats();
        PoolStats {
            cached_bytes: e32 * std::mem::size_of::<f32>() + e64 * std::mem::size_of::<f64>(),
            cached_buffers: c32 + c64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for CudaMemPool {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: all interior mutability is through Mutex + atomics.
unsafe impl Send for CudaMemPool {}
unsafe impl Sync for CudaMemPool {}

impl std::fmt::Debug for CudaMemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaMemPool")
            .field("stats", &self.stats())
            .finish()
    }
}
