//! Kernel Event Counters
//!
//! Atomically updated counters for tracking events and paths through the
//! fault pipeline. Counters are grouped on an owning context structure with
//! a lifecycle tied to subsystem bootstrap; there is no module-level mutable
//! state.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Event counter (atomically updated)
#[derive(Debug)]
pub struct VmCounter {
    value: AtomicU64,
}

impl VmCounter {
    /// Create a new counter starting at zero
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Fault Counters
// ============================================================================

/// Fault pipeline counters
///
/// One instance lives on each VM context; every fault invocation updates
/// these through the context it was handed.
#[derive(Debug)]
pub struct FaultCounters {
    /// Faults resolved on the read-locked fast path
    pub minor_faults: VmCounter,
    /// Faults resolved through the full pipeline
    pub major_faults: VmCounter,
    /// Pages retrieved from a pager
    pub page_ins: VmCounter,
    /// Zero-filled pages
    pub zero_fills: VmCounter,
    /// Copy-on-write resolutions that copied page contents
    pub cow_copies: VmCounter,
    /// Copy-on-write resolutions that migrated page ownership
    pub cow_migrations: VmCounter,
    /// Full-fault restarts (busy collisions, map races, vnode contention)
    pub restarts: VmCounter,
    /// Sleeps on a busy page held by another fault
    pub busy_sleeps: VmCounter,
    /// Low-memory escalations
    pub oom_events: VmCounter,
    /// Read-ahead dont-need advisories issued
    pub dontneed_hints: VmCounter,
}

impl FaultCounters {
    pub const fn new() -> Self {
        Self {
            minor_faults: VmCounter::new(),
            major_faults: VmCounter::new(),
            page_ins: VmCounter::new(),
            zero_fills: VmCounter::new(),
            cow_copies: VmCounter::new(),
            cow_migrations: VmCounter::new(),
            restarts: VmCounter::new(),
            busy_sleeps: VmCounter::new(),
            oom_events: VmCounter::new(),
            dontneed_hints: VmCounter::new(),
        }
    }

    /// Capture a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            minor_faults: self.minor_faults.get(),
            major_faults: self.major_faults.get(),
            page_ins: self.page_ins.get(),
            zero_fills: self.zero_fills.get(),
            cow_copies: self.cow_copies.get(),
            cow_migrations: self.cow_migrations.get(),
            restarts: self.restarts.get(),
            busy_sleeps: self.busy_sleeps.get(),
            oom_events: self.oom_events.get(),
            dontneed_hints: self.dontneed_hints.get(),
        }
    }
}

/// Point-in-time view of the fault counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultStatsSnapshot {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub page_ins: u64,
    pub zero_fills: u64,
    pub cow_copies: u64,
    pub cow_migrations: u64,
    pub restarts: u64,
    pub busy_sleeps: u64,
    pub oom_events: u64,
    pub dontneed_hints: u64,
}
