//! Pager Interface - External Backing Store
//!
//! Pagers supply page contents from backing store (file, swap, device).
//! The fault pipeline depends only on the `Pager` trait and asserts one
//! hard contract: every page a pager reports as retrieved must be left
//! exclusively busied and fully valid.
//!
//! Two retrieval modes exist:
//! - `get_pages`: fill the single busied placeholder the walker allocated,
//!   plus best-effort read-behind/read-ahead neighbors.
//! - `populate`: bulk-install a contiguous run of pages (first object,
//!   no backing chain), or report `Bad` to fall back to `get_pages`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::wait::WaitFlag;
use crate::vm::vm_map::VmProt;
use crate::vm::vm_object::VmObject;
use crate::vm::vm_page::PAGE_SIZE;
use crate::vm::VmContext;

// ============================================================================
// Result Codes
// ============================================================================

/// Outcome of a `get_pages` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerResult {
    /// Page retrieved: busied and fully valid in the object
    Ok,
    /// Pager does not supply this page; continue the chain walk
    Bad,
    /// I/O error from the backing store
    Error,
    /// Request lies beyond the backing store's bounds
    OutOfRange,
}

/// Outcome of a `populate` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateResult {
    /// Pages [first, last] installed, each busied and fully valid
    Run(u64, u64),
    /// Populate not applicable; fall back to `get_pages`
    Bad,
    /// I/O error from the backing store
    Error,
}

// ============================================================================
// Pager Trait
// ============================================================================

/// External backing-store interface
pub trait Pager: Send + Sync {
    /// Retrieve the page at `pindex` into the busied placeholder already
    /// tabled in `object`, with best-effort `behind`/`ahead` neighbors
    fn get_pages(
        &self,
        ctx: &VmContext,
        object: &Arc<VmObject>,
        pindex: u64,
        behind: u64,
        ahead: u64,
    ) -> PagerResult;

    /// Bulk-install a run of pages around `pindex`
    fn populate(
        &self,
        _ctx: &VmContext,
        _object: &Arc<VmObject>,
        _pindex: u64,
        _fault_type: VmProt,
    ) -> PopulateResult {
        PopulateResult::Bad
    }

    /// Does this pager implement `populate`?
    fn can_populate(&self) -> bool {
        false
    }
}

// ============================================================================
// Vnode Lock Provider
// ============================================================================

/// A backing file node with its lock
///
/// The vnode lock is held across pager calls for file-backed objects. The
/// fault pipeline acquires it opportunistically: try first, and on
/// contention release all fault state, block, and restart.
#[derive(Debug)]
pub struct Vnode {
    /// Node identity (for diagnostics)
    pub id: u64,
    locked: AtomicBool,
    wait: WaitFlag,
}

impl Vnode {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            locked: AtomicBool::new(false),
            wait: WaitFlag::new(),
        }
    }

    /// Try to acquire the vnode lock without blocking
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::SeqCst)
    }

    /// Acquire the vnode lock, blocking until available
    pub fn lock_blocking(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            self.wait.sleep_while(|| self.locked.load(Ordering::SeqCst));
        }
    }

    /// Release the vnode lock
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        self.wait.wake();
    }

    /// Is the lock currently held?
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Vnode Pager
// ============================================================================

/// File-backed pager over an in-memory backing store
///
/// Serves `get_pages` from a byte buffer standing in for file contents.
/// Requests beyond the buffer's page bounds are out of range.
pub struct VnodePager {
    content: Mutex<Vec<u8>>,
    size_pages: u64,
    /// Pager calls serviced (observability for callers)
    calls: AtomicU64,
}

impl VnodePager {
    pub fn new(content: Vec<u8>) -> Self {
        let size_pages = ((content.len() + PAGE_SIZE - 1) / PAGE_SIZE) as u64;
        Self {
            content: Mutex::new(content),
            size_pages,
            calls: AtomicU64::new(0),
        }
    }

    /// Backing store size in pages
    pub fn size_pages(&self) -> u64 {
        self.size_pages
    }

    /// Number of `get_pages` calls serviced
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Copy one backing page into a frame, zero-padding the tail
    fn fill_frame(&self, ctx: &VmContext, pindex: u64, page_num: u32) {
        let content = self.content.lock();
        let start = (pindex as usize) * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(content.len());
        ctx.pages.zero_frame(page_num);
        if start < content.len() {
            ctx.pages.write_frame(page_num, 0, &content[start..end]);
        }
    }
}

impl Pager for VnodePager {
    fn get_pages(
        &self,
        ctx: &VmContext,
        object: &Arc<VmObject>,
        pindex: u64,
        behind: u64,
        ahead: u64,
    ) -> PagerResult {
        if pindex >= self.size_pages {
            return PagerResult::OutOfRange;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        // The walker tabled a busied placeholder for the faulting index
        let Some(page_num) = object.page_lookup(pindex) else {
            return PagerResult::Error;
        };
        let page = Arc::clone(ctx.pages.page(page_num));
        debug_assert!(page.is_xbusy(), "placeholder not busied");

        self.fill_frame(ctx, pindex, page_num);
        page.set_fully_valid();

        // Read-behind/read-ahead neighbors: best effort, never required
        let lo = pindex.saturating_sub(behind);
        let hi = (pindex + ahead).min(self.size_pages.saturating_sub(1));
        for idx in lo..=hi {
            if idx == pindex || object.page_lookup(idx).is_some() {
                continue;
            }
            let Some(extra) = ctx.pages.alloc_busied() else {
                break;
            };
            if object.page_insert(idx, &extra).is_err() {
                ctx.pages.free_page(&extra);
                continue;
            }
            self.fill_frame(ctx, idx, extra.page_num);
            extra.set_fully_valid();
            ctx.pages.deactivate(&extra);
            extra.xunbusy();
        }

        PagerResult::Ok
    }
}

// ============================================================================
// Phys Pager
// ============================================================================

/// Populate-capable pager for physically contiguous objects
///
/// Installs aligned runs of `chunk_pages` pages at once, filling each page
/// with a deterministic pattern derived from its index.
pub struct PhysPager {
    chunk_pages: u64,
    populate_calls: AtomicU64,
}

impl PhysPager {
    pub fn new(chunk_pages: u64) -> Self {
        debug_assert!(chunk_pages.is_power_of_two());
        Self {
            chunk_pages,
            populate_calls: AtomicU64::new(0),
        }
    }

    /// Number of `populate` calls serviced
    pub fn populate_calls(&self) -> u64 {
        self.populate_calls.load(Ordering::Relaxed)
    }

    /// Pattern byte for a page index
    pub fn pattern(pindex: u64) -> u8 {
        (pindex & 0xFF) as u8
    }
}

impl Pager for PhysPager {
    fn get_pages(
        &self,
        _ctx: &VmContext,
        _object: &Arc<VmObject>,
        _pindex: u64,
        _behind: u64,
        _ahead: u64,
    ) -> PagerResult {
        // Bulk path only; single-page retrieval is not applicable
        PagerResult::Bad
    }

    fn populate(
        &self,
        ctx: &VmContext,
        object: &Arc<VmObject>,
        pindex: u64,
        _fault_type: VmProt,
    ) -> PopulateResult {
        if pindex >= object.size_pages() {
            return PopulateResult::Error;
        }
        self.populate_calls.fetch_add(1, Ordering::Relaxed);

        let mut first = pindex & !(self.chunk_pages - 1);
        let mut last = (first + self.chunk_pages - 1).min(object.size_pages() - 1);

        // Trim the run around slots that are already resident
        for idx in first..=last {
            if object.page_lookup(idx).is_some() {
                if idx < pindex {
                    first = idx + 1;
                } else if idx == pindex {
                    return PopulateResult::Bad;
                } else {
                    last = idx - 1;
                    break;
                }
            }
        }

        let mut installed = first;
        while installed <= last {
            let Some(page) = ctx.pages.alloc_busied() else {
                break;
            };
            if object.page_insert(installed, &page).is_err() {
                ctx.pages.free_page(&page);
                break;
            }
            ctx.pages.zero_frame(page.page_num);
            let pattern = [Self::pattern(installed); 8];
            ctx.pages.write_frame(page.page_num, 0, &pattern);
            page.set_fully_valid();
            installed += 1;
        }

        if installed <= pindex {
            // Could not cover the faulting index; undo what we placed
            for idx in first..installed {
                if let Some(pn) = object.page_remove(idx) {
                    let page = Arc::clone(ctx.pages.page(pn));
                    ctx.pages.free_page(&page);
                }
            }
            return PopulateResult::Error;
        }

        PopulateResult::Run(first, installed - 1)
    }

    fn can_populate(&self) -> bool {
        true
    }
}
