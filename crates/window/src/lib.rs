#![deny(unsafe_code)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Window / credit counter (C3): the engine's single backpressure
//! primitive. Grounded on the original `WindowSizeCounter`
//! (atomic counter with a suspend bit) and `DynamicWindowPool` (a pool
//! of reclaimable extra credit shared across sources of the same kind).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;

/// Per-source atomic gauge bounding events in flight from that source.
///
/// Invariant: `0 <= available() <= capacity()` at every observation
/// point (§8 property 2).
#[derive(Debug)]
pub struct WindowSizeCounter {
    available: AtomicI64,
    static_capacity: AtomicI64,
    dynamic_capacity: AtomicI64,
    suspended: AtomicBool,
}

impl WindowSizeCounter {
    /// Creates a counter at full static capacity, no dynamic capacity,
    /// not suspended.
    pub fn new(static_capacity: u32) -> Self {
        Self {
            available: AtomicI64::new(static_capacity as i64),
            static_capacity: AtomicI64::new(static_capacity as i64),
            dynamic_capacity: AtomicI64::new(0),
            suspended: AtomicBool::new(false),
        }
    }

    /// Total capacity `S + D`.
    pub fn capacity(&self) -> i64 {
        self.static_capacity.load(Ordering::Acquire) + self.dynamic_capacity.load(Ordering::Acquire)
    }

    /// Current value of `W`.
    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    /// Attempts to atomically decrement `W` by up to `n`. Returns the
    /// number actually granted, `0 <= granted <= n`. Lock-free. Always
    /// returns 0 while suspended.
    pub fn request(&self, n: u32) -> u32 {
        if self.suspended.load(Ordering::Acquire) {
            return 0;
        }
        let n = n as i64;
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return 0;
            }
            let grant = current.min(n);
            match self.available.compare_exchange_weak(
                current,
                current - grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return grant as u32,
                Err(observed) => current = observed,
            }
        }
    }

    /// Atomically adds `n` to `W`, saturating at `S + D`.
    pub fn release(&self, n: u32) {
        let n = n as i64;
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let cap = self.capacity();
            let updated = (current + n).min(cap);
            match self.available.compare_exchange_weak(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Changes static/dynamic capacity while preserving
    /// `W + in_flight == S + D`, i.e. `W` moves by exactly the change in
    /// total capacity, then clamps to the new capacity's bounds. May
    /// only be called by the main loop during reconfiguration or by a
    /// dynamic balancer.
    pub fn resize(&self, new_static: u32, new_dynamic: u32) {
        let old_capacity = self.capacity();
        let new_capacity = new_static as i64 + new_dynamic as i64;
        let delta = new_capacity - old_capacity;
        self.static_capacity.store(new_static as i64, Ordering::Release);
        self.dynamic_capacity.store(new_dynamic as i64, Ordering::Release);
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let updated = (current + delta).clamp(0, new_capacity);
            match self.available.compare_exchange_weak(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Forces `request()` to return 0 regardless of `W`.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    /// Lifts a previous `suspend()`.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    /// Whether `suspend()` is currently in effect.
    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

struct DynamicWindowPoolInner {
    pool_size: u64,
    free_window: u64,
}

/// A pool of extra, reclaimable window credit shared across the sources
/// of one driver, mirroring the original `DynamicWindowPool`'s
/// balance-on-demand behaviour.
pub struct DynamicWindowPool {
    inner: Mutex<DynamicWindowPoolInner>,
}

impl DynamicWindowPool {
    /// Creates a pool with `pool_size` total reclaimable credit.
    pub fn new(pool_size: u64) -> Self {
        Self {
            inner: Mutex::new(DynamicWindowPoolInner {
                pool_size,
                free_window: pool_size,
            }),
        }
    }

    /// Requests up to `wanted` units of dynamic credit from the pool;
    /// returns the amount actually granted.
    pub fn request(&self, wanted: u64) -> u64 {
        let mut inner = self.inner.lock();
        let grant = wanted.min(inner.free_window);
        inner.free_window -= grant;
        grant
    }

    /// Returns previously granted dynamic credit to the pool.
    pub fn release(&self, amount: u64) {
        let mut inner = self.inner.lock();
        inner.free_window = (inner.free_window + amount).min(inner.pool_size);
    }

    /// An even split of the pool's total size across `num_sources`
    /// sources, rounding down; used by a balancer that periodically
    /// re-levels dynamic allocation across sources of the same driver.
    pub fn balanced_window(&self, num_sources: u64) -> u64 {
        if num_sources == 0 {
            return 0;
        }
        self.inner.lock().pool_size / num_sources
    }

    /// Total pool size.
    pub fn pool_size(&self) -> u64 {
        self.inner.lock().pool_size
    }

    /// Currently unallocated credit.
    pub fn free_window(&self) -> u64 {
        self.inner.lock().free_window
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_never_exceeds_available_or_goes_negative() {
        let w = WindowSizeCounter::new(2);
        assert_eq!(w.request(5), 2);
        assert_eq!(w.available(), 0);
        assert_eq!(w.request(1), 0);
    }

    #[test]
    fn release_saturates_at_capacity() {
        let w = WindowSizeCounter::new(2);
        let _ = w.request(2);
        w.release(10);
        assert_eq!(w.available(), 2);
    }

    #[test]
    fn suspend_blocks_request_regardless_of_available() {
        let w = WindowSizeCounter::new(4);
        w.suspend();
        assert_eq!(w.request(1), 0);
        w.resume();
        assert_eq!(w.request(1), 1);
    }

    #[test]
    fn resize_preserves_in_flight_invariant() {
        let w = WindowSizeCounter::new(4);
        let _ = w.request(3); // in_flight = 3, W = 1
        w.resize(6, 0); // capacity 4 -> 6, delta +2
        assert_eq!(w.available(), 3);
        assert_eq!(w.capacity(), 6);
        // in_flight should now read as capacity - available == 3, unchanged
    }

    #[test]
    fn dynamic_pool_grants_and_reclaims() {
        let pool = DynamicWindowPool::new(10);
        assert_eq!(pool.request(6), 6);
        assert_eq!(pool.request(6), 4);
        pool.release(6);
        assert_eq!(pool.free_window(), 6);
    }

    #[test]
    fn invariant_holds_under_interleaved_ops() {
        let w = WindowSizeCounter::new(8);
        for _ in 0..100 {
            let got = w.request(3);
            assert!(w.available() >= 0 && w.available() <= w.capacity());
            w.release(got);
            assert!(w.available() >= 0 && w.available() <= w.capacity());
        }
    }
}
