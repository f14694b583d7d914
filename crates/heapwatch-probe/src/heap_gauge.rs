//! Allocator-level heap accounting
//!
//! [`CountingAllocator`] wraps the host's global allocator and keeps
//! live/cumulative/peak byte counters in process-wide atomics. Hosts that
//! want allocator-precise heap numbers install it once:
//!
//! ```ignore
//! use heapwatch_probe::CountingAllocator;
//!
//! #[global_allocator]
//! static ALLOC: CountingAllocator = CountingAllocator::system();
//! ```
//!
//! The probe reads the counters through [`HeapGauge`] whether or not the
//! wrapper is installed; without it the gauge reports itself as absent
//! and the probe falls back to OS counters.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);
static PEAK_BYTES: AtomicU64 = AtomicU64::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Counting wrapper around the system allocator.
pub struct CountingAllocator {
    inner: System,
}

impl CountingAllocator {
    pub const fn system() -> Self {
        Self { inner: System }
    }

    fn record_alloc(size: usize) {
        INSTALLED.store(true, Ordering::Relaxed);
        TOTAL_BYTES.fetch_add(size as u64, Ordering::Relaxed);
        let live = LIVE_BYTES.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        PEAK_BYTES.fetch_max(live, Ordering::Relaxed);
    }

    fn record_dealloc(size: usize) {
        LIVE_BYTES.fetch_sub(size as u64, Ordering::Relaxed);
    }
}

// SAFETY: delegates every operation to the system allocator; the counters
// are plain relaxed atomics and never allocate themselves.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            Self::record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        Self::record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            Self::record_dealloc(layout.size());
            Self::record_alloc(new_size);
        }
        new_ptr
    }
}

/// Read-side view of the allocator counters.
#[derive(Debug, Clone, Copy)]
pub struct HeapGauge;

/// Snapshot of allocator counters in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeSnapshot {
    pub live: u64,
    pub total_malloced: u64,
    pub peak: u64,
}

impl HeapGauge {
    /// Whether the counting allocator has observed at least one
    /// allocation, i.e. is installed as the global allocator.
    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::Relaxed)
    }

    pub fn snapshot() -> GaugeSnapshot {
        GaugeSnapshot {
            live: LIVE_BYTES.load(Ordering::Relaxed),
            total_malloced: TOTAL_BYTES.load(Ordering::Relaxed),
            peak: PEAK_BYTES.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_alloc_and_dealloc() {
        let alloc = CountingAllocator::system();
        let layout = Layout::from_size_align(4096, 8).unwrap();

        let before = HeapGauge::snapshot();
        let ptr = unsafe { alloc.alloc(layout) };
        assert!(!ptr.is_null());
        let during = HeapGauge::snapshot();
        assert!(during.live >= before.live + 4096);
        assert!(during.total_malloced >= before.total_malloced + 4096);
        assert!(during.peak >= during.live);

        // Only direct calls on this wrapper touch the counters here, so
        // the arithmetic is exact.
        unsafe { alloc.dealloc(ptr, layout) };
        let after = HeapGauge::snapshot();
        assert_eq!(after.live, during.live - 4096);
        assert!(HeapGauge::is_installed());
    }
}
