//! Pageout Support - Allocation Pressure Handling
//!
//! The fault pipeline never fails an allocation outright: it releases all
//! fault state, waits briefly, and retries. Repeated failure past a bounded
//! attempt count escalates to the context's low-memory hook (or the default
//! inactive-queue reclaim) and resets the attempt counter instead of
//! propagating an error to the faulting thread.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::kern::wait::cpu_relax;
use crate::vm::VmContext;

/// Allocation attempts before low-memory escalation
pub const OOM_ATTEMPT_LIMIT: u32 = 3;

/// Probes spent in one bounded allocation wait
const ALLOC_WAIT_SPINS: u32 = 64;

/// Wait after a failed page allocation, escalating past the attempt cap
pub fn vm_wait_alloc(ctx: &VmContext) {
    let attempts = ctx.oom_attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempts >= OOM_ATTEMPT_LIMIT {
        log::warn!(
            "page allocation failed {} times, running low-memory reclaim",
            attempts
        );
        ctx.counters.oom_events.inc();
        ctx.run_low_memory();
        ctx.oom_attempts.store(0, Ordering::SeqCst);
        return;
    }

    for _ in 0..ALLOC_WAIT_SPINS {
        cpu_relax();
    }
}

/// Note a successful allocation: pressure has eased
pub fn vm_alloc_ok(ctx: &VmContext) {
    ctx.oom_attempts.store(0, Ordering::SeqCst);
}

/// Default low-memory reclaim: free clean inactive pages
///
/// Scans the inactive queue, skipping pages that are busied, wired, held,
/// or dirty, and returns how many pages were freed.
pub fn reclaim_inactive(ctx: &VmContext, target: u32) -> u32 {
    let mut reclaimed = 0;
    let mut scanned = 0;
    // The queue length shrinks as pages are popped; bound the scan
    let limit = ctx.pages.page_count() as u32;

    while reclaimed < target && scanned < limit {
        let Some(page_num) = ctx.pages.peek_inactive() else {
            break;
        };
        scanned += 1;
        let page = Arc::clone(ctx.pages.page(page_num));

        if !page.try_xbusy() {
            continue;
        }
        if page.is_wired() || page.is_held() || page.is_dirty() {
            ctx.pages.activate(&page);
            page.xunbusy();
            continue;
        }

        if let Some(owner) = page.owner() {
            if let Some(object) = ctx.objects.lookup(owner.object) {
                object.page_remove(owner.pindex);
            }
        }
        ctx.pages.free_page(&page);
        reclaimed += 1;
    }

    if reclaimed > 0 {
        log::debug!("reclaimed {} inactive pages", reclaimed);
    }
    reclaimed
}
