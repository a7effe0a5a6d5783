//! In-memory code cache.
//!
//! Provides:
//! - Bump-pointer reservations over a fixed address range
//! - Lookup of committed code by handle or by instruction pointer
//! - Statistics and debugging support
//!
//! The cache only hands out addresses; the bytes live in the committed
//! [`CodeObject`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use super::{AllocError, CodeHandle};
use crate::buffer::align_up;
use crate::finalizer::CodeObject;

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    handle: CodeHandle,
    size: u64,
    code: Arc<CodeObject>,
}

/// Reservation bookkeeping.
#[derive(Debug, Default)]
struct Region {
    /// Next free address.
    top: u64,
    /// Outstanding reservations: base -> size.
    reserved: FxHashMap<u64, u64>,
}

#[derive(Debug, Default)]
struct Committed {
    by_base: BTreeMap<u64, CacheEntry>,
    by_handle: FxHashMap<CodeHandle, u64>,
}

// =============================================================================
// Code Cache
// =============================================================================

/// A fixed-size code cache.
///
/// Thread-safe via internal locking.
#[derive(Debug)]
pub struct CodeCache {
    base: u64,
    capacity: u64,
    region: Mutex<Region>,
    committed: RwLock<Committed>,
    next_handle: AtomicU64,
    reservations: AtomicU64,
    commits: AtomicU64,
    releases: AtomicU64,
    failures: AtomicU64,
}

impl CodeCache {
    /// Create a cache covering `[base, base + capacity)`.
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            region: Mutex::new(Region {
                top: base,
                reserved: FxHashMap::default(),
            }),
            committed: RwLock::new(Committed::default()),
            next_handle: AtomicU64::new(1),
            reservations: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reserve `size` bytes at an `alignment`-aligned address.
    pub fn reserve(&self, size: u64, alignment: u32) -> Result<u64, AllocError> {
        let end = self.base + self.capacity;
        let mut region = self.region.lock();
        let start = align_up(region.top, alignment.max(1) as u64);
        if start.saturating_add(size) > end {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(AllocError::CacheFull {
                requested: size,
                available: end.saturating_sub(start),
            });
        }
        region.top = start + size;
        region.reserved.insert(start, size);
        self.reservations.fetch_add(1, Ordering::Relaxed);
        trace!(base = format_args!("{start:#x}"), size, "reserved code space");
        Ok(start)
    }

    /// Drop an uncommitted reservation; unknown bases are ignored.
    ///
    /// Space is only reclaimed when the reservation is the most recent one.
    pub fn release(&self, base: u64) {
        let mut region = self.region.lock();
        if let Some(size) = region.reserved.remove(&base) {
            if base + size == region.top {
                region.top = base;
            }
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Turn the reservation at `base` into a live entry.
    pub fn commit(&self, base: u64, code: Arc<CodeObject>) -> Result<CodeHandle, AllocError> {
        let size = self
            .region
            .lock()
            .reserved
            .remove(&base)
            .ok_or(AllocError::UnknownReservation(base))?;

        let handle = CodeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut committed = self.committed.write();
        committed.by_handle.insert(handle, base);
        committed
            .by_base
            .insert(base, CacheEntry { handle, size, code });
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Look up committed code by handle.
    pub fn lookup(&self, handle: CodeHandle) -> Option<Arc<CodeObject>> {
        let committed = self.committed.read();
        let base = committed.by_handle.get(&handle)?;
        committed.by_base.get(base).map(|e| Arc::clone(&e.code))
    }

    /// Find the entry containing the given instruction pointer.
    pub fn find_by_ip(&self, ip: u64) -> Option<(CodeHandle, u64, Arc<CodeObject>)> {
        let committed = self.committed.read();
        let (&base, entry) = committed.by_base.range(..=ip).next_back()?;
        (ip < base + entry.size).then(|| (entry.handle, base, Arc::clone(&entry.code)))
    }

    /// Unregister committed code. Its address range is not reused.
    pub fn remove(&self, handle: CodeHandle) -> Option<Arc<CodeObject>> {
        let mut committed = self.committed.write();
        let base = committed.by_handle.remove(&handle)?;
        committed.by_base.remove(&base).map(|e| e.code)
    }

    /// Number of committed entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.committed.read().by_base.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes handed out so far, reservations included.
    #[inline]
    pub fn used(&self) -> u64 {
        self.region.lock().top - self.base
    }

    /// Reservations neither committed nor released.
    pub fn outstanding(&self) -> usize {
        self.region.lock().reserved.len()
    }

    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            reservations: self.reservations.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            used: self.used(),
            capacity: self.capacity,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub reservations: u64,
    pub commits: u64,
    pub releases: u64,
    /// Reservations refused for lack of space.
    pub failures: u64,
    pub used: u64,
    pub capacity: u64,
}

impl CodeCacheStats {
    /// Fraction of the cache handed out, from 0.0 to 1.0.
    #[inline]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}
