//! VM Fault - Page Fault Resolution
//!
//! The fault pipeline resolves a faulting virtual address into an installed
//! hardware mapping. A fault moves through the stages:
//!
//! 1. **Lookup**: resolve the address through the map into an entry, the
//!    first object of its shadow chain, and the effective protection.
//! 2. **Soft fault**: a read-lock-only shortcut when the page is already
//!    resident and fully valid in the first object.
//! 3. **Chain walk**: search the shadow chain, allocating placeholders,
//!    invoking the pager, or zero-filling when the chain runs out.
//! 4. **Copy-on-write**: migrate or copy a backing page into the first
//!    object before any writable mapping is installed.
//! 5. **Relookup**: re-validate the map snapshot if validity was dropped.
//! 6. **Install**: enter the translation, prefault neighbors, wire or
//!    activate the page, and release the busy state.
//!
//! Transient conditions (busy collisions, map races, vnode contention,
//! allocation pressure) release every held resource and restart the whole
//! fault from the top; only the entry point loops. Terminal conditions map
//! to distinct `KernStatus` codes.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::vm::pager::{Pager, PagerResult, PopulateResult};
use crate::vm::pmap::PmapEnterFlags;
use crate::vm::vm_map::{FaultLookup, MapBehavior, MapError, Relookup, VmMap, VmProt};
use crate::vm::vm_object::VmObject;
use crate::vm::vm_page::{trunc_page, round_page, PageFlags, VmPage, PAGE_SHIFT, PAGE_SIZE};
use crate::vm::vm_pageout;
use crate::vm::{TrapCompat, VmContext};

// ============================================================================
// Tunables
// ============================================================================

/// Prefault window behind the faulting address, in pages
const PREFAULT_BEHIND: u64 = 4;

/// Prefault window ahead of the faulting address, in pages
const PREFAULT_AHEAD: u64 = 4;

/// Largest batch the prefault pass stages at once
const PREFAULT_BATCH: usize = 16;

/// Initial adaptive read-ahead window, in pages
const READ_AHEAD_INIT: u32 = 4;

/// Maximum adaptive read-ahead window, in pages
const READ_AHEAD_MAX: u32 = 8;

/// Read-behind window when the access pattern is cold, in pages
const READ_BEHIND: u64 = 2;

/// Allocation retries before the fault gives up with a shortage code
const MAX_ALLOC_RETRIES: u32 = 16;

// ============================================================================
// Public Types
// ============================================================================

/// Terminal fault outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernStatus {
    /// Fault resolved; the mapping is installed
    Success,
    /// Unrecoverable failure (dead object, pager I/O error)
    Failure,
    /// Address not covered by any mapping
    InvalidAddress,
    /// Memory could not be allocated within the retry budget
    ResourceShortage,
    /// Access violates the entry protection
    ProtectionFailure,
    /// Address lies beyond the backing store's bounds
    OutOfBounds,
}

bitflags::bitflags! {
    /// Fault configuration flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// Wire the resolved page and install a wired mapping
        const WIRE    = 0x0001;
        /// Fail with a bounds error instead of zero-filling
        const NO_FILL = 0x0002;
        /// Mark the resolved page dirty regardless of access type
        const DIRTY   = 0x0004;
    }
}

/// User-visible signal for a terminal fault outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    /// Segmentation violation
    Segv,
    /// Bus error
    Bus,
}

// ============================================================================
// Fault State
// ============================================================================

/// Per-fault transient state
///
/// Owned exclusively by one fault invocation and threaded through every
/// stage. Teardown happens exactly once through `unlock_and_deallocate`,
/// which undoes whatever the completed stages acquired; `Drop` is a
/// backstop for early exits.
struct FaultState<'a> {
    ctx: &'a VmContext,
    map: &'a VmMap,

    /// Faulting address, page aligned
    vaddr: u64,
    /// Requested access
    fault_type: VmProt,
    /// Configuration flags
    flags: FaultFlags,
    /// Caller wants a held reference to the resolved page
    hold: bool,

    // Map snapshot
    entry_start: u64,
    entry_end: u64,
    prot: VmProt,
    wired: bool,
    nosync: bool,
    behavior: MapBehavior,
    map_generation: u64,
    lookup_still_valid: bool,

    /// First object of the chain and the faulting index within it
    first_object: Arc<VmObject>,
    first_pindex: u64,
    /// Reference + paging-in-progress held on `first_object`
    chain_held: bool,

    /// Object and index currently being examined
    object: Arc<VmObject>,
    pindex: u64,

    /// Candidate page, exclusively busied by this fault
    m: Option<Arc<VmPage>>,
    /// Placeholder reserving the first-object slot during the walk
    first_m: Option<Arc<VmPage>>,

    /// Vnode lock held across pager calls
    vnode: Option<Arc<crate::vm::pager::Vnode>>,
    /// Held page handed back to the caller
    held: Option<Arc<VmPage>>,
}

impl<'a> FaultState<'a> {
    fn new(
        ctx: &'a VmContext,
        map: &'a VmMap,
        vaddr: u64,
        fault_type: VmProt,
        flags: FaultFlags,
        hold: bool,
        lookup: FaultLookup,
    ) -> Self {
        let mut fault_type = fault_type;
        let mut wired = lookup.wired;
        if flags.contains(FaultFlags::WIRE) {
            // Wiring resolves the page for every access the entry allows
            fault_type = lookup.prot;
            wired = true;
        }
        let first_object = lookup.object;
        Self {
            ctx,
            map,
            vaddr,
            fault_type,
            flags,
            hold,
            entry_start: lookup.entry_start,
            entry_end: lookup.entry_end,
            prot: lookup.prot,
            wired,
            nosync: lookup.nosync,
            behavior: lookup.behavior,
            map_generation: lookup.generation,
            lookup_still_valid: true,
            object: Arc::clone(&first_object),
            pindex: lookup.pindex,
            first_pindex: lookup.pindex,
            first_object,
            chain_held: false,
            m: None,
            first_m: None,
            vnode: None,
            held: None,
        }
    }

    /// Virtual address that maps a first-object page index
    fn vaddr_of(&self, pindex: u64) -> u64 {
        let delta = pindex as i64 - self.first_pindex as i64;
        self.vaddr.wrapping_add_signed(delta << PAGE_SHIFT)
    }

    /// Release a busied page this fault owns
    ///
    /// Valid pages stay cached in their object; invalid placeholders give
    /// up their slot reservation and return to the free list.
    fn release_page(&self, m: Arc<VmPage>) {
        debug_assert!(m.is_xbusy(), "releasing a page this fault does not own");
        if m.is_fully_valid() {
            self.ctx.pages.deactivate(&m);
            m.xunbusy();
        } else {
            if let Some(owner) = m.owner() {
                if let Some(obj) = self.ctx.objects.lookup(owner.object) {
                    obj.page_remove(owner.pindex);
                }
            }
            self.ctx.pages.free_page(&m);
        }
    }

    /// Undo everything the completed stages acquired
    ///
    /// Idempotent: every teardown action is guarded by the state it tears
    /// down, so both explicit calls and the `Drop` backstop are safe.
    fn unlock_and_deallocate(&mut self) {
        if let Some(m) = self.m.take() {
            self.release_page(m);
        }
        if let Some(m) = self.first_m.take() {
            self.release_page(m);
        }
        if let Some(vnode) = self.vnode.take() {
            vnode.unlock();
        }
        if self.chain_held {
            self.chain_held = false;
            self.first_object.pip_wakeup();
            let first = Arc::clone(&self.first_object);
            self.ctx.object_deallocate(&first);
        }
    }
}

impl Drop for FaultState<'_> {
    fn drop(&mut self) {
        self.unlock_and_deallocate();
    }
}

/// One full resolution attempt's outcome
enum FaultAction {
    Done(KernStatus),
    /// Transient condition; restart the fault from the top
    Restart,
    /// Allocation failed; wait for memory and restart
    AllocRetry,
}

// ============================================================================
// Entry Points
// ============================================================================

/// Resolve a page fault
pub fn vm_fault(
    ctx: &VmContext,
    map: &VmMap,
    vaddr: u64,
    fault_type: VmProt,
    flags: FaultFlags,
) -> KernStatus {
    fault_internal(ctx, map, vaddr, fault_type, flags, false).0
}

/// Resolve a page fault and return a held reference to the resolved page
pub fn vm_fault_hold(
    ctx: &VmContext,
    map: &VmMap,
    vaddr: u64,
    fault_type: VmProt,
    flags: FaultFlags,
) -> (KernStatus, Option<Arc<VmPage>>) {
    fault_internal(ctx, map, vaddr, fault_type, flags, true)
}

/// Resolve a trap-originated fault and translate the outcome to a signal
pub fn vm_fault_trap(
    ctx: &VmContext,
    map: &VmMap,
    vaddr: u64,
    fault_type: VmProt,
    flags: FaultFlags,
) -> (KernStatus, Option<FaultSignal>) {
    let status = vm_fault(ctx, map, vaddr, fault_type, flags);
    let signal = match status {
        KernStatus::Success => None,
        KernStatus::InvalidAddress | KernStatus::ProtectionFailure => Some(FaultSignal::Segv),
        KernStatus::OutOfBounds => Some(match ctx.trap_compat() {
            TrapCompat::Bsd => FaultSignal::Bus,
            TrapCompat::Legacy => FaultSignal::Segv,
        }),
        KernStatus::Failure | KernStatus::ResourceShortage => Some(FaultSignal::Bus),
    };
    (status, signal)
}

/// Fault in and wire every page in [start, end)
///
/// Rolls back already-wired pages if any fault fails.
pub fn vm_fault_wire(ctx: &VmContext, map: &VmMap, start: u64, end: u64) -> KernStatus {
    let first = trunc_page(start);
    let last = round_page(end);

    let mut addr = first;
    while addr < last {
        let status = vm_fault(ctx, map, addr, VmProt::READ, FaultFlags::WIRE);
        if status != KernStatus::Success {
            vm_fault_unwire(ctx, map, first, addr);
            return status;
        }
        addr += PAGE_SIZE as u64;
    }

    map.adjust_wired(first, last, 1);
    KernStatus::Success
}

/// Unwire every page in [start, end)
pub fn vm_fault_unwire(ctx: &VmContext, map: &VmMap, start: u64, end: u64) {
    let first = trunc_page(start);
    let last = round_page(end);

    let mut addr = first;
    while addr < last {
        if let Some(page_num) = map.pmap.extract(addr) {
            let page = Arc::clone(ctx.pages.page(page_num));
            if page.is_wired() && page.unwire() {
                ctx.pages.activate(&page);
            }
        }
        addr += PAGE_SIZE as u64;
    }

    map.pmap.unwire(first, last);
    map.adjust_wired(first, last, -1);
}

fn fault_internal(
    ctx: &VmContext,
    map: &VmMap,
    vaddr: u64,
    fault_type: VmProt,
    flags: FaultFlags,
    hold: bool,
) -> (KernStatus, Option<Arc<VmPage>>) {
    let vaddr = trunc_page(vaddr);
    let mut alloc_retries = 0u32;

    loop {
        let generation = map.generation();
        let lookup = match map.fault_lookup(ctx, vaddr, fault_type) {
            Ok(lookup) => lookup,
            Err(MapError::InTransition) => {
                // Another thread is reshaping the entry; wait for it to
                // finish and take the whole fault again
                ctx.counters.restarts.inc();
                map.sleep_transition(generation);
                continue;
            }
            Err(MapError::InvalidAddress) => return (KernStatus::InvalidAddress, None),
            Err(MapError::ProtectionFailure) => return (KernStatus::ProtectionFailure, None),
            Err(_) => return (KernStatus::Failure, None),
        };

        let mut fs = FaultState::new(ctx, map, vaddr, fault_type, flags, hold, lookup);
        match fault_impl(&mut fs) {
            FaultAction::Done(KernStatus::Success) => {
                vm_pageout::vm_alloc_ok(ctx);
                let held = fs.held.take();
                return (KernStatus::Success, held);
            }
            FaultAction::Done(status) => return (status, None),
            FaultAction::Restart => {
                ctx.counters.restarts.inc();
                continue;
            }
            FaultAction::AllocRetry => {
                alloc_retries += 1;
                if alloc_retries > MAX_ALLOC_RETRIES {
                    log::warn!("fault at {:#x}: allocation retry budget exhausted", vaddr);
                    return (KernStatus::ResourceShortage, None);
                }
                vm_pageout::vm_wait_alloc(ctx);
                continue;
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

fn fault_impl(fs: &mut FaultState) -> FaultAction {
    // Fast path: no wiring install, nothing held yet
    if !fs.flags.contains(FaultFlags::WIRE) {
        if let Some(status) = fault_soft(fs) {
            return FaultAction::Done(status);
        }
    }

    // Full pipeline: hold the chain against truncation and teardown
    let first_object = Arc::clone(&fs.first_object);
    first_object.reference();
    first_object.pip_add();
    fs.chain_held = true;

    // Bulk populate path: first object only, no shadowing
    if let Some(pager) = first_object.pager.clone() {
        if pager.can_populate() && first_object.backing().is_none() {
            match fault_populate(fs, &pager) {
                PopulateAction::Done(action) => return action,
                PopulateAction::NotApplicable => {}
            }
        }
    }

    // Shadow-chain walk
    loop {
        let object = Arc::clone(&fs.object);

        if object.is_dead() {
            fs.unlock_and_deallocate();
            return FaultAction::Done(KernStatus::Failure);
        }
        if object.is_terminating() {
            // Teardown in progress: get out of its way and re-evaluate
            fs.unlock_and_deallocate();
            return FaultAction::Restart;
        }

        // SEARCH: is the page resident here?
        if fs.m.is_none() {
            if let Some(page_num) = object.page_lookup(fs.pindex) {
                let m = Arc::clone(fs.ctx.pages.page(page_num));
                if !m.try_xbusy() {
                    fs.unlock_and_deallocate();
                    fs.ctx.counters.busy_sleeps.inc();
                    m.sleep_busy();
                    return FaultAction::Restart;
                }
                // Busy acquired: the page may have been freed or re-tabled
                // while we raced for it
                match m.owner() {
                    Some(owner) if owner.object == object.id && owner.pindex == fs.pindex => {
                        fs.m = Some(m);
                    }
                    _ => {
                        m.xunbusy();
                        fs.unlock_and_deallocate();
                        return FaultAction::Restart;
                    }
                }
            }
        }
        if let Some(m) = fs.m.as_ref() {
            if m.is_fully_valid() {
                break;
            }
        }

        let is_first = object.id == first_object.id;

        // ALLOCATE: reserve the slot if this object can produce the page
        if fs.m.is_none() && (is_first || object.pager.is_some()) {
            match fs.ctx.pages.alloc_busied() {
                Some(page) => match object.page_insert(fs.pindex, &page) {
                    Ok(()) => fs.m = Some(page),
                    Err(existing) => {
                        // Lost the slot race; wait on the winner's page
                        fs.ctx.pages.free_page(&page);
                        let winner = Arc::clone(fs.ctx.pages.page(existing));
                        fs.unlock_and_deallocate();
                        fs.ctx.counters.busy_sleeps.inc();
                        winner.sleep_busy();
                        return FaultAction::Restart;
                    }
                },
                None => {
                    fs.unlock_and_deallocate();
                    return FaultAction::AllocRetry;
                }
            }
        }

        // FETCH: ask the pager to fill the reserved slot
        if fs.m.is_some() && object.pager.is_some() {
            let pager = object.pager.clone().unwrap();
            match fault_getpages(fs, &object, &pager) {
                GetPages::Found => {
                    fs.ctx.counters.page_ins.inc();
                    break;
                }
                GetPages::NotApplicable => {}
                GetPages::OutOfRange => {
                    fs.unlock_and_deallocate();
                    return FaultAction::Done(KernStatus::OutOfBounds);
                }
                GetPages::IoError => {
                    fs.unlock_and_deallocate();
                    return FaultAction::Done(KernStatus::Failure);
                }
                GetPages::Restarted => return FaultAction::Restart,
            }
        }

        // ADVANCE or ZERO_FILL
        match object.backing() {
            Some(link) => {
                if is_first {
                    // The placeholder stays tabled: it reserves the
                    // first-object slot against concurrent faults while
                    // we walk the chain
                    fs.first_m = fs.m.take();
                } else if let Some(m) = fs.m.take() {
                    object.page_remove(fs.pindex);
                    fs.ctx.pages.free_page(&m);
                }
                let Some(next) = fs.ctx.objects.lookup(link.id) else {
                    fs.unlock_and_deallocate();
                    return FaultAction::Done(KernStatus::Failure);
                };
                log::trace!(
                    "fault {:#x}: descending {:?} -> {:?}",
                    fs.vaddr,
                    object.id,
                    next.id
                );
                fs.pindex += link.offset_pages;
                fs.object = next;
            }
            None => {
                // Chain exhausted: zero-fill in the first object
                if fs.flags.contains(FaultFlags::NO_FILL) {
                    fs.unlock_and_deallocate();
                    return FaultAction::Done(KernStatus::OutOfBounds);
                }
                if !is_first {
                    fs.object = Arc::clone(&first_object);
                    fs.pindex = fs.first_pindex;
                }

                let m = match fs.m.take().or_else(|| fs.first_m.take()) {
                    Some(m) => m,
                    None => match fs.ctx.pages.alloc_busied() {
                        Some(page) => match first_object.page_insert(fs.first_pindex, &page) {
                            Ok(()) => page,
                            Err(existing) => {
                                fs.ctx.pages.free_page(&page);
                                let winner = Arc::clone(fs.ctx.pages.page(existing));
                                fs.unlock_and_deallocate();
                                fs.ctx.counters.busy_sleeps.inc();
                                winner.sleep_busy();
                                return FaultAction::Restart;
                            }
                        },
                        None => {
                            fs.unlock_and_deallocate();
                            return FaultAction::AllocRetry;
                        }
                    },
                };

                if !m.has_flags(PageFlags::ZERO) {
                    fs.ctx.pages.zero_frame(m.page_num);
                }
                m.clear_flags(PageFlags::ZERO);
                m.set_fully_valid();
                fs.ctx.counters.zero_fills.inc();
                fs.m = Some(m);
                break;
            }
        }
    }

    // FOUND: fs.m is exclusively busied and fully valid
    if fs.object.id != first_object.id {
        if fs.fault_type.intersects(VmProt::WRITE | VmProt::COPY) {
            match fault_cow(fs) {
                CowResult::Done => {}
                CowResult::AllocRetry => {
                    fs.unlock_and_deallocate();
                    return FaultAction::AllocRetry;
                }
                CowResult::Restart => {
                    fs.unlock_and_deallocate();
                    return FaultAction::Restart;
                }
            }
        } else {
            // Reading through the chain: share the backing page, but only
            // read-only so a later write faults again and copies
            fs.prot.remove(VmProt::WRITE);
        }
    }

    // Relookup: re-validate the snapshot if validity was dropped
    if !fs.lookup_still_valid {
        match fs.map.fault_relookup(
            fs.vaddr,
            fs.fault_type,
            &fs.first_object,
            fs.first_pindex,
            fs.map_generation,
        ) {
            Relookup::Unchanged => fs.lookup_still_valid = true,
            Relookup::Revalidated { prot, generation } => {
                fs.prot = fs.prot.intersection(prot);
                fs.map_generation = generation;
                fs.lookup_still_valid = true;
                if fs.prot.access_bits().is_empty() {
                    fs.unlock_and_deallocate();
                    return FaultAction::Restart;
                }
            }
            Relookup::Restart => {
                fs.unlock_and_deallocate();
                return FaultAction::Restart;
            }
        }
    }

    // Install the mapping
    let m = fs.m.clone().expect("resolved fault without a page");
    assert!(
        m.is_xbusy() && m.is_fully_valid(),
        "resolved page must be exclusively busied and fully valid"
    );

    fault_dirty(fs, &m);

    let mut pe_flags = PmapEnterFlags::empty();
    if fs.wired {
        pe_flags |= PmapEnterFlags::WIRED;
    }
    if fs
        .map
        .pmap
        .enter(fs.vaddr, m.page_num, fs.prot, pe_flags, 0)
        .is_err()
    {
        fs.unlock_and_deallocate();
        return FaultAction::AllocRetry;
    }

    if !fs.flags.contains(FaultFlags::WIRE) {
        fault_prefault(fs);
    }

    if fs.wired {
        m.wire();
        fs.ctx.pages.dequeue(&m);
    } else {
        fs.ctx.pages.activate(&m);
    }

    fs.ctx.counters.major_faults.inc();
    if fs.hold {
        m.hold();
        fs.held = Some(Arc::clone(&m));
    }

    // Serialization release point: concurrent faults on this page may
    // proceed from here
    m.xunbusy();
    fs.m = None;
    fs.unlock_and_deallocate();
    FaultAction::Done(KernStatus::Success)
}

// ============================================================================
// Fast Path
// ============================================================================

/// Soft fault: map an already-resident, fully-valid first-object page
/// under the object read lock, with no allocation and no pager call
fn fault_soft(fs: &mut FaultState) -> Option<KernStatus> {
    let first_object = Arc::clone(&fs.first_object);
    if first_object.is_dead() || first_object.is_terminating() {
        return None;
    }
    // Bulk-populate objects may install runs that cross large-page
    // boundaries; those always take the full pipeline
    if first_object
        .pager
        .as_ref()
        .map(|p| p.can_populate())
        .unwrap_or(false)
    {
        return None;
    }

    let page_num = first_object.page_lookup(fs.first_pindex)?;
    let m = Arc::clone(fs.ctx.pages.page(page_num));
    if m.is_xbusy() && fs.fault_type.intersects(VmProt::WRITE) {
        return None;
    }
    if !m.is_fully_valid() {
        return None;
    }
    // The page may have been freed or re-tabled between the lookup and
    // here; a stale identity falls through to the serialized slow path
    match m.owner() {
        Some(owner) if owner.object == first_object.id && owner.pindex == fs.first_pindex => {}
        _ => return None,
    }

    // Superpage promotion when the pmap is capable and the whole aligned
    // run is eligible
    let mut psind = 0u8;
    let mut enter_vaddr = fs.vaddr;
    let mut enter_page = m.page_num;
    if let Some(span) = fs.map.pmap.superpage_pages() {
        if let Some((va, pn)) = superpage_candidate(fs, span) {
            psind = 1;
            enter_vaddr = va;
            enter_page = pn;
        }
    }

    fault_dirty(fs, &m);

    let mut pe_flags = PmapEnterFlags::empty();
    if fs.wired {
        pe_flags |= PmapEnterFlags::WIRED;
    }
    if fs
        .map
        .pmap
        .enter(enter_vaddr, enter_page, fs.prot, pe_flags, psind)
        .is_err()
    {
        return None;
    }

    if fs.wired {
        m.wire();
        fs.ctx.pages.dequeue(&m);
    } else {
        fs.ctx.pages.activate(&m);
    }
    if fs.hold {
        m.hold();
        fs.held = Some(Arc::clone(&m));
    }
    fault_prefault(fs);
    fs.ctx.counters.minor_faults.inc();
    log::trace!("fault {:#x}: soft fault resolved", fs.vaddr);
    Some(KernStatus::Success)
}

/// Find an aligned, fully-eligible superpage run covering the fault
fn superpage_candidate(fs: &FaultState, span: u64) -> Option<(u64, u32)> {
    if span < 2 || !span.is_power_of_two() {
        return None;
    }
    let bytes = span * PAGE_SIZE as u64;
    let va_base = fs.vaddr & !(bytes - 1);
    if va_base < fs.entry_start || va_base + bytes > fs.entry_end {
        return None;
    }
    let delta = (fs.vaddr - va_base) >> PAGE_SHIFT;
    let pindex_base = fs.first_pindex.checked_sub(delta)?;
    let want_write = fs.fault_type.intersects(VmProt::WRITE);

    let mut base_page = None;
    for i in 0..span {
        let page_num = fs.first_object.page_lookup(pindex_base + i)?;
        let page = fs.ctx.pages.page(page_num);
        if !page.is_fully_valid() || page.is_xbusy() {
            return None;
        }
        // Writable superpage mappings require every constituent page to
        // already carry modified state
        if want_write && !page.is_dirty() {
            return None;
        }
        match base_page {
            None => base_page = Some(page_num),
            Some(base) if page_num == base + i as u32 => {}
            Some(_) => return None,
        }
    }
    base_page.map(|page_num| (va_base, page_num))
}

// ============================================================================
// Pager Bridge
// ============================================================================

enum GetPages {
    Found,
    NotApplicable,
    OutOfRange,
    IoError,
    Restarted,
}

/// Invoke the pager for the reserved slot, handling the vnode lock and
/// the adaptive read-ahead window
fn fault_getpages(fs: &mut FaultState, object: &Arc<VmObject>, pager: &Arc<dyn Pager>) -> GetPages {
    let (behind, ahead) = fault_readahead(fs);

    // The map cannot be trusted across a pager call
    fs.lookup_still_valid = false;

    if let Some(vnode) = object.vnode.clone() {
        let already_held = fs.vnode.as_ref().map(|v| v.id == vnode.id).unwrap_or(false);
        if !already_held {
            if !vnode.try_lock() {
                // Contended: drop everything, wait our turn, start over
                fs.unlock_and_deallocate();
                vnode.lock_blocking();
                vnode.unlock();
                return GetPages::Restarted;
            }
            fs.vnode = Some(vnode);
        }
    }

    match pager.get_pages(fs.ctx, object, fs.pindex, behind, ahead) {
        PagerResult::Ok => {
            let m = fs.m.as_ref().expect("pager fill without a placeholder");
            assert!(
                m.is_xbusy() && m.is_fully_valid(),
                "pager must return the page exclusively busied and fully valid"
            );
            GetPages::Found
        }
        PagerResult::Bad => GetPages::NotApplicable,
        PagerResult::Error => {
            log::warn!("fault {:#x}: pager error on {:?}", fs.vaddr, object.id);
            GetPages::IoError
        }
        PagerResult::OutOfRange => GetPages::OutOfRange,
    }
}

/// Compute the read-behind/read-ahead window from the entry's declared
/// behavior and its adaptive sequential counter
fn fault_readahead(fs: &mut FaultState) -> (u64, u64) {
    let vaddr = fs.vaddr;
    let behavior = fs.behavior;

    let nera = fs.map.with_entry(fs.entry_start, |entry| {
        let era = entry.read_ahead.load(Ordering::Relaxed);
        let nera = match behavior {
            MapBehavior::Random => 0,
            MapBehavior::Sequential => READ_AHEAD_MAX,
            MapBehavior::Normal => {
                if entry.next_read.load(Ordering::Relaxed) == vaddr {
                    if era == 0 {
                        READ_AHEAD_INIT
                    } else {
                        (era * 2).min(READ_AHEAD_MAX)
                    }
                } else {
                    0
                }
            }
        };
        entry.read_ahead.store(nera, Ordering::Relaxed);
        entry
            .next_read
            .store(vaddr + PAGE_SIZE as u64, Ordering::Relaxed);
        nera
    });
    let Some(nera) = nera else {
        return (0, 0);
    };

    // Crossing a full-window boundary at maximum read-ahead means the
    // cluster behind us has been consumed; advise it away
    let window = READ_AHEAD_MAX as u64 * PAGE_SIZE as u64;
    if nera == READ_AHEAD_MAX && vaddr % window == 0 {
        fault_dontneed(fs);
    }

    let behind = if nera > 0 {
        0
    } else {
        fs.first_pindex.min(READ_BEHIND)
    };
    (behind, nera as u64)
}

/// Advise away the consumed cluster behind a sequential scan
fn fault_dontneed(fs: &FaultState) {
    let window = READ_AHEAD_MAX as u64 * PAGE_SIZE as u64;
    let start = fs.vaddr.saturating_sub(window).max(fs.entry_start);
    if start >= fs.vaddr {
        return;
    }

    fs.map.pmap.advise_dontneed(start, fs.vaddr);
    fs.ctx.counters.dontneed_hints.inc();

    let span_pages = (fs.vaddr - start) >> PAGE_SHIFT;
    let first = fs.first_pindex.saturating_sub(span_pages);
    for pindex in first..fs.first_pindex {
        if let Some(page_num) = fs.first_object.page_lookup(pindex) {
            let page = Arc::clone(fs.ctx.pages.page(page_num));
            if !page.is_xbusy() && !page.is_wired() && page.is_fully_valid() {
                fs.ctx.pages.deactivate(&page);
            }
        }
    }
}

// ============================================================================
// Populate Path
// ============================================================================

enum PopulateAction {
    Done(FaultAction),
    NotApplicable,
}

/// Bulk-install a pager-provided run of pages
fn fault_populate(fs: &mut FaultState, pager: &Arc<dyn Pager>) -> PopulateAction {
    let first_object = Arc::clone(&fs.first_object);
    fs.lookup_still_valid = false;

    let (run_first, run_last) =
        match pager.populate(fs.ctx, &first_object, fs.first_pindex, fs.fault_type) {
            PopulateResult::Bad => return PopulateAction::NotApplicable,
            PopulateResult::Error => {
                fs.unlock_and_deallocate();
                return PopulateAction::Done(FaultAction::Done(KernStatus::Failure));
            }
            PopulateResult::Run(first, last) => (first, last),
        };

    // Re-validate before committing any of the run
    match fs.map.fault_relookup(
        fs.vaddr,
        fs.fault_type,
        &first_object,
        fs.first_pindex,
        fs.map_generation,
    ) {
        Relookup::Unchanged => {}
        Relookup::Revalidated { prot, generation } => {
            fs.prot = fs.prot.intersection(prot);
            fs.map_generation = generation;
            if fs.prot.access_bits().is_empty() {
                release_run(fs, &first_object, run_first, run_last);
                fs.unlock_and_deallocate();
                return PopulateAction::Done(FaultAction::Restart);
            }
        }
        Relookup::Restart => {
            release_run(fs, &first_object, run_first, run_last);
            fs.unlock_and_deallocate();
            return PopulateAction::Done(FaultAction::Restart);
        }
    }
    fs.lookup_still_valid = true;

    let span = fs.map.pmap.superpage_pages();
    let mut pe_flags = PmapEnterFlags::empty();
    if fs.wired {
        pe_flags |= PmapEnterFlags::WIRED;
    }

    let mut installed: u64 = 0;
    let mut pindex = run_first;
    while pindex <= run_last {
        let Some(page_num) = first_object.page_lookup(pindex) else {
            pindex += 1;
            continue;
        };
        let page = Arc::clone(fs.ctx.pages.page(page_num));
        assert!(
            page.is_xbusy() && page.is_fully_valid(),
            "populated pages must be exclusively busied and fully valid"
        );

        let va = fs.vaddr_of(pindex);
        if va < fs.entry_start || va >= fs.entry_end {
            // Outside the entry: keep the page cached but unmapped
            fs.release_page(page);
            pindex += 1;
            continue;
        }

        // Promote aligned chunks when the pmap is capable
        let mut step = 1u64;
        let mut psind = 0u8;
        if let Some(span) = span {
            let bytes = span * PAGE_SIZE as u64;
            if pindex % span == 0
                && pindex + span - 1 <= run_last
                && va % bytes == 0
                && va + bytes <= fs.entry_end
                && run_is_contiguous(fs, &first_object, pindex, span, page_num)
            {
                psind = 1;
                step = span;
            }
        }

        if fs
            .map
            .pmap
            .enter(va, page_num, fs.prot, pe_flags, psind)
            .is_err()
        {
            release_run(fs, &first_object, pindex, run_last);
            fs.unlock_and_deallocate();
            return PopulateAction::Done(FaultAction::AllocRetry);
        }

        for i in 0..step {
            let Some(pn) = first_object.page_lookup(pindex + i) else {
                continue;
            };
            let pg = Arc::clone(fs.ctx.pages.page(pn));
            if pindex + i == fs.first_pindex {
                fault_dirty(fs, &pg);
                if fs.hold {
                    pg.hold();
                    fs.held = Some(Arc::clone(&pg));
                }
            }
            if fs.wired {
                pg.wire();
                fs.ctx.pages.dequeue(&pg);
            } else {
                fs.ctx.pages.activate(&pg);
            }
            pg.xunbusy();
        }

        installed += step;
        pindex += step;
    }

    fs.ctx.counters.page_ins.add(installed);
    fs.ctx.counters.major_faults.inc();
    fs.unlock_and_deallocate();
    PopulateAction::Done(FaultAction::Done(KernStatus::Success))
}

/// Release every still-busied page of a populate run
fn release_run(fs: &FaultState, object: &Arc<VmObject>, first: u64, last: u64) {
    for pindex in first..=last {
        if let Some(page_num) = object.page_lookup(pindex) {
            let page = Arc::clone(fs.ctx.pages.page(page_num));
            if page.is_xbusy() {
                fs.release_page(page);
            }
        }
    }
}

fn run_is_contiguous(
    fs: &FaultState,
    object: &Arc<VmObject>,
    pindex: u64,
    span: u64,
    base_page: u32,
) -> bool {
    for i in 1..span {
        match object.page_lookup(pindex + i) {
            Some(pn) if pn == base_page + i as u32 => {
                let page = fs.ctx.pages.page(pn);
                if !page.is_xbusy() || !page.is_fully_valid() {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

// ============================================================================
// Copy-on-Write Resolver
// ============================================================================

enum CowResult {
    Done,
    AllocRetry,
    Restart,
}

/// Bring a backing-object page into the first object for write access
///
/// Migration fast path: when the backing object is anonymous with exactly
/// one shadow and one reference and both object locks upgrade without
/// blocking, ownership of the page moves to the first object with no byte
/// copy. Otherwise the contents are copied into the placeholder page.
fn fault_cow(fs: &mut FaultState) -> CowResult {
    let first_object = Arc::clone(&fs.first_object);
    let backing_object = Arc::clone(&fs.object);
    let src = fs.m.take().expect("copy-on-write without a source page");

    // Migration eligibility
    if backing_object.ref_count() == 1
        && backing_object.shadow_count() == 1
        && backing_object.is_anonymous()
    {
        // Lock order: first object, then backing; both must upgrade
        // without blocking or we fall back to the copy
        if let Some(mut first_pages) = first_object.pages_lock().try_write() {
            if let Some(mut src_pages) = backing_object.pages_lock().try_write() {
                src_pages.remove(&fs.pindex);
                let displaced = first_pages.remove(&fs.first_pindex);
                first_pages.insert(fs.first_pindex, src.page_num);
                drop(src_pages);
                drop(first_pages);

                src.set_owner(first_object.id, fs.first_pindex);
                if displaced.is_some() {
                    if let Some(placeholder) = fs.first_m.take() {
                        debug_assert_eq!(Some(placeholder.page_num), displaced);
                        placeholder.clear_owner();
                        fs.ctx.pages.free_page(&placeholder);
                    }
                }

                fs.ctx.counters.cow_migrations.inc();
                log::debug!(
                    "fault {:#x}: migrated page {} from {:?} to {:?}",
                    fs.vaddr,
                    src.page_num,
                    backing_object.id,
                    first_object.id
                );
                fs.m = Some(src);
                fs.object = Arc::clone(&first_object);
                fs.pindex = fs.first_pindex;
                return CowResult::Done;
            }
        }
    }

    // Copy path: fill the placeholder from the source
    let dst = match fs.first_m.take() {
        Some(dst) => dst,
        None => match fs.ctx.pages.alloc_busied() {
            Some(page) => match first_object.page_insert(fs.first_pindex, &page) {
                Ok(()) => page,
                Err(_) => {
                    fs.ctx.pages.free_page(&page);
                    fs.m = Some(src);
                    return CowResult::Restart;
                }
            },
            None => {
                fs.m = Some(src);
                return CowResult::AllocRetry;
            }
        },
    };

    fs.ctx.pages.copy_frame(src.page_num, dst.page_num);
    dst.clear_flags(PageFlags::ZERO);
    dst.set_fully_valid();

    // Release the source back to its object; it keeps its contents
    src.xunbusy();

    fs.ctx.counters.cow_copies.inc();
    fs.m = Some(dst);
    fs.object = first_object;
    fs.pindex = fs.first_pindex;
    CowResult::Done
}

// ============================================================================
// Mapping Installer Helpers
// ============================================================================

/// Mark the resolved page dirty when the access carries write semantics,
/// honoring the entry's no-sync hint
fn fault_dirty(fs: &FaultState, m: &VmPage) {
    if !fs.prot.intersects(VmProt::WRITE) || m.has_flags(PageFlags::UNMANAGED) {
        return;
    }
    if fs.flags.contains(FaultFlags::WIRE) && !fs.flags.contains(FaultFlags::DIRTY) {
        // Wiring is not an access; do not forge modified state
        return;
    }
    let write_now = fs.fault_type.intersects(VmProt::WRITE) || fs.flags.contains(FaultFlags::DIRTY);
    if !write_now {
        return;
    }
    if fs.nosync && !fs.flags.contains(FaultFlags::DIRTY) {
        m.set_flags(PageFlags::NOSYNC);
    } else {
        m.clear_flags(PageFlags::NOSYNC);
    }
    m.set_dirty();
}

/// Speculatively map resident, valid, unbusied neighbors of the fault
fn fault_prefault(fs: &FaultState) {
    let prot = fs.prot.intersection(VmProt::READ | VmProt::EXECUTE);
    if prot.is_empty() {
        return;
    }

    let page_size = PAGE_SIZE as u64;
    let start = fs
        .vaddr
        .saturating_sub(PREFAULT_BEHIND * page_size)
        .max(fs.entry_start);
    let end = (fs.vaddr + (PREFAULT_AHEAD + 1) * page_size).min(fs.entry_end);

    let mut batch: heapless::Vec<(u64, u32), PREFAULT_BATCH> = heapless::Vec::new();
    let mut addr = start;
    while addr < end {
        if addr != fs.vaddr && fs.map.pmap.is_prefaultable(addr) {
            let delta = (addr as i64 - fs.vaddr as i64) >> PAGE_SHIFT;
            let pindex = fs.first_pindex.wrapping_add_signed(delta);
            if let Some(page_num) = fs.first_object.page_lookup(pindex) {
                let page = fs.ctx.pages.page(page_num);
                if page.is_fully_valid() && !page.is_xbusy() {
                    let _ = batch.push((addr, page_num));
                }
            }
        }
        addr += page_size;
    }

    for (addr, page_num) in batch {
        let _ = fs
            .map
            .pmap
            .enter(addr, page_num, prot, PmapEnterFlags::empty(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pager::{Vnode, VnodePager};
    use crate::vm::pmap::{PmapOps, SoftPmap};
    use crate::vm::vm_map::MapEntryFlags;
    use crate::vm::vm_object::ObjectKind;
    use crate::vm::VmContext;
    use core::sync::atomic::{AtomicU32, AtomicU64};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    const BASE: u64 = 0x40000;
    const PG: u64 = PAGE_SIZE as u64;

    fn setup(npages: u32) -> (Arc<VmContext>, Arc<SoftPmap>, Arc<VmMap>) {
        setup_with_superpage(npages, None)
    }

    fn setup_with_superpage(
        npages: u32,
        superpage: Option<u64>,
    ) -> (Arc<VmContext>, Arc<SoftPmap>, Arc<VmMap>) {
        let ctx = VmContext::bootstrap(npages);
        let pmap = Arc::new(SoftPmap::new(superpage));
        let map = Arc::new(VmMap::new(
            0x1000,
            0x1_0000_0000,
            Arc::clone(&pmap) as Arc<dyn crate::vm::pmap::PmapOps>,
        ));
        (ctx, pmap, map)
    }

    /// Table a valid page with the given fill byte at (object, pindex)
    fn seed_page(ctx: &VmContext, obj: &Arc<VmObject>, pindex: u64, fill: u8) -> Arc<VmPage> {
        let page = ctx.pages.alloc_busied().unwrap();
        obj.page_insert(pindex, &page).unwrap();
        ctx.pages.zero_frame(page.page_num);
        ctx.pages.write_frame(page.page_num, 0, &[fill; 32]);
        page.clear_flags(PageFlags::ZERO);
        page.set_fully_valid();
        page.xunbusy();
        page
    }

    // ------------------------------------------------------------------
    // Test pagers
    // ------------------------------------------------------------------

    /// Fills only the requested page, slowly, and asserts that no two
    /// requests are ever serviced concurrently
    struct SlowPager {
        fill: u8,
        delay_ms: u64,
        calls: AtomicU64,
        in_flight: AtomicU32,
    }

    impl SlowPager {
        fn new(fill: u8, delay_ms: u64) -> Self {
            Self {
                fill,
                delay_ms,
                calls: AtomicU64::new(0),
                in_flight: AtomicU32::new(0),
            }
        }
    }

    impl Pager for SlowPager {
        fn get_pages(
            &self,
            ctx: &VmContext,
            object: &Arc<VmObject>,
            pindex: u64,
            _behind: u64,
            _ahead: u64,
        ) -> PagerResult {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "two faults entered the pager at once");
            self.calls.fetch_add(1, Ordering::SeqCst);

            thread::sleep(Duration::from_millis(self.delay_ms));

            let page_num = object.page_lookup(pindex).expect("placeholder missing");
            let page = Arc::clone(ctx.pages.page(page_num));
            assert!(page.is_xbusy());
            ctx.pages.zero_frame(page_num);
            ctx.pages.write_frame(page_num, 0, &[self.fill; 16]);
            page.clear_flags(PageFlags::ZERO);
            page.set_fully_valid();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            PagerResult::Ok
        }
    }

    /// Fills only the requested page; ignores the read-ahead window
    struct OnDemandPager {
        size_pages: u64,
        calls: AtomicU64,
    }

    impl OnDemandPager {
        fn new(size_pages: u64) -> Self {
            Self {
                size_pages,
                calls: AtomicU64::new(0),
            }
        }
    }

    impl Pager for OnDemandPager {
        fn get_pages(
            &self,
            ctx: &VmContext,
            object: &Arc<VmObject>,
            pindex: u64,
            _behind: u64,
            _ahead: u64,
        ) -> PagerResult {
            if pindex >= self.size_pages {
                return PagerResult::OutOfRange;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let page_num = object.page_lookup(pindex).expect("placeholder missing");
            let page = Arc::clone(ctx.pages.page(page_num));
            ctx.pages.zero_frame(page_num);
            ctx.pages.write_frame(page_num, 0, &[pindex as u8; 8]);
            page.clear_flags(PageFlags::ZERO);
            page.set_fully_valid();
            PagerResult::Ok
        }
    }

    /// Violates the pager contract: reports success without validating
    struct BrokenPager;

    impl Pager for BrokenPager {
        fn get_pages(
            &self,
            _ctx: &VmContext,
            _object: &Arc<VmObject>,
            _pindex: u64,
            _behind: u64,
            _ahead: u64,
        ) -> PagerResult {
            PagerResult::Ok
        }
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    #[test]
    fn scenario_a_soft_fault_read() {
        let (ctx, pmap, map) = setup(16);
        let obj = ctx.objects.allocate(4);
        let page = seed_page(&ctx, &obj, 0, 0x11);

        map.enter(BASE, BASE + 4 * PG, Some(Arc::clone(&obj)), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(pmap.extract(BASE), Some(page.page_num));
        assert!(pmap.prot_of(BASE).unwrap().contains(VmProt::READ));

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.minor_faults, 1);
        assert_eq!(snap.major_faults, 0);
    }

    #[test]
    fn scenario_b_zero_fill_write() {
        let (ctx, pmap, map) = setup(16);
        let obj = ctx.objects.allocate(4);
        map.enter(BASE, BASE + 4 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        let page_num = obj.page_lookup(1).expect("zero-fill page tabled");
        assert_eq!(pmap.extract(BASE + PG), Some(page_num));

        // Every byte of the resolved page is zero
        let mut buf = std::vec![0xFFu8; PAGE_SIZE];
        ctx.pages.read_frame(page_num, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(ctx.pages.page(page_num).is_dirty());

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.major_faults, 1);
        assert_eq!(snap.zero_fills, 1);
        assert_eq!(snap.minor_faults, 0);
    }

    #[test]
    fn scenario_c_concurrent_faults_single_pager_call() {
        let (ctx, pmap, map) = setup(32);
        let pager = Arc::new(SlowPager::new(0xAB, 30));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Vnode,
            4,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty())
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), KernStatus::Success);
        }

        assert_eq!(pager.calls.load(Ordering::SeqCst), 1);
        let page_num = pmap.extract(BASE).expect("mapping installed");
        let mut buf = [0u8; 4];
        ctx.pages.read_frame(page_num, &mut buf);
        assert_eq!(buf, [0xAB; 4]);
    }

    #[test]
    fn scenario_d_cow_migration_not_copy() {
        let (ctx, pmap, map) = setup(16);
        let backing = ctx.objects.allocate(4);
        let page = seed_page(&ctx, &backing, 0, 0xCD);

        let shadow = ctx.objects.shadow(&backing, 0, 4);
        // Drop the creation reference: the shadow link is now the backing
        // object's only reference and only shadow
        ctx.object_deallocate(&backing);
        assert_eq!(backing.ref_count(), 1);
        assert_eq!(backing.shadow_count(), 1);

        map.enter(BASE, BASE + 4 * PG, Some(shadow.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.cow_migrations, 1);
        assert_eq!(snap.cow_copies, 0);

        // Ownership moved: same physical page, now tabled in the shadow
        assert_eq!(shadow.page_lookup(0), Some(page.page_num));
        assert_eq!(backing.page_lookup(0), None);
        assert_eq!(pmap.extract(BASE), Some(page.page_num));
        assert!(pmap.prot_of(BASE).unwrap().contains(VmProt::WRITE));

        let mut buf = [0u8; 4];
        ctx.pages.read_frame(page.page_num, &mut buf);
        assert_eq!(buf, [0xCD; 4]);
    }

    #[test]
    fn scenario_e_out_of_bounds_no_residue() {
        let (ctx, _pmap, map) = setup(16);
        let pager: Arc<dyn Pager> =
            Arc::new(VnodePager::new(std::vec![0x22u8; PAGE_SIZE * 2]));
        let obj = ctx
            .objects
            .allocate_with_pager(ObjectKind::Vnode, 2, pager, None);
        // The entry spans more pages than the backing store provides
        map.enter(BASE, BASE + 4 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let free_before = ctx.pages.free_count();
        let status = vm_fault(&ctx, &map, BASE + 3 * PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::OutOfBounds);

        // No page allocated, no partial state retained
        assert_eq!(obj.page_lookup(3), None);
        assert_eq!(ctx.pages.free_count(), free_before);
        assert_eq!(obj.pip_count(), 0);
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    #[test]
    fn test_cow_copy_preserves_backing_page() {
        let (ctx, pmap, map) = setup(16);
        let backing = ctx.objects.allocate(4);
        let original = seed_page(&ctx, &backing, 0, 0x77);

        let shadow = ctx.objects.shadow(&backing, 0, 4);
        // The test keeps its own reference, so migration is ineligible
        assert_eq!(backing.ref_count(), 2);

        map.enter(BASE, BASE + 4 * PG, Some(shadow.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.cow_copies, 1);
        assert_eq!(snap.cow_migrations, 0);

        // The shadow owns a different page with equal contents; the
        // backing page is untouched
        let copy_num = shadow.page_lookup(0).expect("copy tabled in shadow");
        assert_ne!(copy_num, original.page_num);
        assert_eq!(backing.page_lookup(0), Some(original.page_num));
        assert_eq!(pmap.extract(BASE), Some(copy_num));

        let mut src = [0u8; 8];
        let mut dst = [0u8; 8];
        ctx.pages.read_frame(original.page_num, &mut src);
        ctx.pages.read_frame(copy_num, &mut dst);
        assert_eq!(src, dst);
        assert_eq!(src, [0x77; 8]);
    }

    #[test]
    fn test_read_through_chain_maps_read_only() {
        let (ctx, pmap, map) = setup(16);
        let backing = ctx.objects.allocate(4);
        let page = seed_page(&ctx, &backing, 0, 0x31);
        let shadow = ctx.objects.shadow(&backing, 0, 4);

        map.enter(BASE, BASE + 4 * PG, Some(shadow.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        // The backing page is shared, write permission stripped
        assert_eq!(pmap.extract(BASE), Some(page.page_num));
        assert!(!pmap.prot_of(BASE).unwrap().contains(VmProt::WRITE));
        assert_eq!(backing.page_lookup(0), Some(page.page_num));
        assert_eq!(ctx.counters.snapshot().cow_copies, 0);
    }

    #[test]
    fn test_at_most_one_busy_under_contention() {
        let (ctx, _pmap, map) = setup(64);
        let pager = Arc::new(SlowPager::new(0x5C, 20));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Vnode,
            4,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // SlowPager asserts that no two faults hold the slot at once
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty())
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), KernStatus::Success);
        }
        assert_eq!(pager.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reference_balance() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(4);
        map.enter(BASE, BASE + 4 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let refs_before = obj.ref_count();
        assert_eq!(obj.pip_count(), 0);

        // Success path
        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(obj.ref_count(), refs_before);
        assert_eq!(obj.pip_count(), 0);

        // Terminal-failure path restores the same balances
        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::NO_FILL);
        assert_eq!(status, KernStatus::OutOfBounds);
        assert_eq!(obj.ref_count(), refs_before);
        assert_eq!(obj.pip_count(), 0);
    }

    #[test]
    fn test_zero_fill_determinism() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Dirty a page, free it, and make sure a zero-fill of the
        // recycled frame still comes out spotless
        let scratch = ctx.pages.alloc_busied().unwrap();
        ctx.pages.write_frame(scratch.page_num, 0, &[0xEE; 64]);
        ctx.pages.free_page(&scratch);

        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        let page_num = obj.page_lookup(0).unwrap();
        let mut buf = std::vec![0xFFu8; PAGE_SIZE];
        ctx.pages.read_frame(page_num, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));

        let page = ctx.pages.page(page_num);
        assert!(page.is_fully_valid());
        assert!(!page.is_xbusy());
    }

    #[test]
    fn test_no_restart_when_map_unchanged() {
        let (ctx, _pmap, map) = setup(16);
        let pager: Arc<dyn Pager> = Arc::new(OnDemandPager::new(4));
        let obj = ctx
            .objects
            .allocate_with_pager(ObjectKind::Vnode, 4, pager, None);
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // The pager call drops map validity; with no concurrent map
        // change the relookup must be a trivial no-op
        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(ctx.counters.snapshot().restarts, 0);
    }

    // ------------------------------------------------------------------
    // Pipeline behaviors
    // ------------------------------------------------------------------

    #[test]
    fn test_wire_and_unwire_range() {
        let (ctx, pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault_wire(&ctx, &map, BASE, BASE + 2 * PG);
        assert_eq!(status, KernStatus::Success);

        for pindex in 0..2 {
            let page_num = obj.page_lookup(pindex).expect("wired page resident");
            assert!(ctx.pages.page(page_num).is_wired());
            assert!(pmap.is_wired(BASE + pindex * PG));
        }

        vm_fault_unwire(&ctx, &map, BASE, BASE + 2 * PG);
        for pindex in 0..2 {
            let page_num = obj.page_lookup(pindex).unwrap();
            assert!(!ctx.pages.page(page_num).is_wired());
            assert!(!pmap.is_wired(BASE + pindex * PG));
        }
    }

    #[test]
    fn test_wire_rollback_on_failure() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(1);
        map.enter(BASE, BASE + PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Second page of the range is unmapped: the wire must fail and
        // roll back the page it already wired
        let status = vm_fault_wire(&ctx, &map, BASE, BASE + 2 * PG);
        assert_eq!(status, KernStatus::InvalidAddress);

        let page_num = obj.page_lookup(0).expect("page still resident");
        assert!(!ctx.pages.page(page_num).is_wired());
    }

    #[test]
    fn test_trap_signal_translation() {
        let (ctx, _pmap, map) = setup(16);
        let pager: Arc<dyn Pager> = Arc::new(VnodePager::new(std::vec![0u8; PAGE_SIZE]));
        let obj = ctx
            .objects
            .allocate_with_pager(ObjectKind::Vnode, 1, pager, None);
        map.enter(BASE, BASE + 2 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Unmapped address: segmentation violation in either mode
        let (status, signal) =
            vm_fault_trap(&ctx, &map, 0x9999_0000, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::InvalidAddress);
        assert_eq!(signal, Some(FaultSignal::Segv));

        // Out of bounds: bus error by default, segv in legacy mode
        let (status, signal) =
            vm_fault_trap(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::OutOfBounds);
        assert_eq!(signal, Some(FaultSignal::Bus));

        ctx.set_trap_compat(TrapCompat::Legacy);
        let (_, signal) = vm_fault_trap(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(signal, Some(FaultSignal::Segv));
    }

    #[test]
    fn test_no_fill_gives_bounds_error() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::NO_FILL);
        assert_eq!(status, KernStatus::OutOfBounds);
        assert_eq!(obj.resident_page_count(), 0);
    }

    #[test]
    fn test_prefault_maps_resident_neighbors() {
        let (ctx, pmap, map) = setup(16);
        let obj = ctx.objects.allocate(4);
        for pindex in 0..4 {
            seed_page(&ctx, &obj, pindex, pindex as u8);
        }
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);

        // Neighbors were speculatively mapped, read-only
        for pindex in [0u64, 2, 3] {
            let addr = BASE + pindex * PG;
            assert!(pmap.extract(addr).is_some(), "neighbor {:#x} not mapped", addr);
            assert!(!pmap.prot_of(addr).unwrap().contains(VmProt::WRITE));
        }
    }

    #[test]
    fn test_superpage_promotion_on_soft_fault() {
        let (ctx, pmap, map) = setup_with_superpage(16, Some(4));
        let obj = ctx.objects.allocate(4);
        // Bootstrap hands out consecutive page numbers, giving us the
        // physically contiguous aligned run promotion requires
        for pindex in 0..4 {
            seed_page(&ctx, &obj, pindex, 0x44);
        }
        // 0x40000 is aligned to a 4-page (16 KiB) superpage
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(pmap.superpage_installs(), 1);
        assert!(pmap.extract(BASE + 3 * PG).is_some());
        assert_eq!(ctx.counters.snapshot().minor_faults, 1);
    }

    #[test]
    fn test_populate_installs_run() {
        let (ctx, pmap, map) = setup(32);
        let pager = Arc::new(crate::vm::pager::PhysPager::new(4));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Phys,
            4,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        map.enter(BASE, BASE + 4 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(pager.populate_calls(), 1);

        // The whole run was installed and released
        for pindex in 0..4u64 {
            let addr = BASE + pindex * PG;
            let page_num = pmap.extract(addr).expect("run page mapped");
            let mut buf = [0u8; 1];
            ctx.pages.read_frame(page_num, &mut buf);
            assert_eq!(buf[0], crate::vm::pager::PhysPager::pattern(pindex));
            assert!(!ctx.pages.page(page_num).is_xbusy());
        }
        let snap = ctx.counters.snapshot();
        assert_eq!(snap.major_faults, 1);
        assert_eq!(snap.page_ins, 4);
    }

    #[test]
    fn test_populate_superpage_chunks() {
        let (ctx, pmap, map) = setup_with_superpage(32, Some(4));
        let pager = Arc::new(crate::vm::pager::PhysPager::new(4));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Phys,
            4,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        map.enter(BASE, BASE + 4 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        assert_eq!(pmap.superpage_installs(), 1);
        assert_eq!(pmap.resident_count(), 4);
    }

    #[test]
    fn test_vnode_contention_restarts() {
        let (ctx, _pmap, map) = setup(16);
        let vnode = Arc::new(Vnode::new(9));
        let pager: Arc<dyn Pager> = Arc::new(VnodePager::new(std::vec![3u8; PAGE_SIZE]));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Vnode,
            1,
            pager,
            Some(Arc::clone(&vnode)),
        );
        map.enter(BASE, BASE + PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Hold the vnode lock while the fault starts; it must release
        // everything, wait, and restart
        assert!(vnode.try_lock());
        let handle = {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            thread::spawn(move || vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty()))
        };
        thread::sleep(Duration::from_millis(30));
        vnode.unlock();

        assert_eq!(handle.join().unwrap(), KernStatus::Success);
        assert!(ctx.counters.snapshot().restarts >= 1);
        assert!(!vnode.is_locked());
    }

    #[test]
    fn test_in_transition_blocks_until_cleared() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();
        map.set_in_transition(BASE).unwrap();

        let handle = {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            thread::spawn(move || vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty()))
        };
        thread::sleep(Duration::from_millis(20));
        map.clear_in_transition(BASE).unwrap();

        assert_eq!(handle.join().unwrap(), KernStatus::Success);
        assert!(ctx.counters.snapshot().restarts >= 1);
    }

    #[test]
    fn test_readahead_window_adapts() {
        let (ctx, _pmap, map) = setup(64);
        let pager = Arc::new(OnDemandPager::new(16));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Vnode,
            16,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        map.enter(BASE, BASE + 16 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Sequential faulting grows the window to its maximum
        for pindex in 0..4u64 {
            let status = vm_fault(&ctx, &map, BASE + pindex * PG, VmProt::READ, FaultFlags::empty());
            assert_eq!(status, KernStatus::Success);
        }
        let window = map
            .with_entry(BASE, |e| e.read_ahead.load(Ordering::Relaxed))
            .unwrap();
        assert_eq!(window, READ_AHEAD_MAX);

        // A random-access declaration collapses it
        map.set_behavior(BASE, MapBehavior::Random).unwrap();
        let status = vm_fault(&ctx, &map, BASE + 9 * PG, VmProt::READ, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        let window = map
            .with_entry(BASE, |e| e.read_ahead.load(Ordering::Relaxed))
            .unwrap();
        assert_eq!(window, 0);
    }

    #[test]
    fn test_dontneed_advice_on_window_boundary() {
        let (ctx, pmap, map) = setup(64);
        let pager = Arc::new(OnDemandPager::new(16));
        let obj = ctx.objects.allocate_with_pager(
            ObjectKind::Vnode,
            16,
            Arc::clone(&pager) as Arc<dyn Pager>,
            None,
        );
        // BASE is aligned to the full read-ahead window
        assert_eq!(BASE % (READ_AHEAD_MAX as u64 * PG), 0);
        map.enter(BASE, BASE + 16 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Sequentially consume a full window and cross its boundary
        for pindex in 0..=(READ_AHEAD_MAX as u64) {
            let status = vm_fault(&ctx, &map, BASE + pindex * PG, VmProt::READ, FaultFlags::empty());
            assert_eq!(status, KernStatus::Success);
        }

        assert_eq!(pmap.dontneed_calls(), 1);
        assert_eq!(ctx.counters.snapshot().dontneed_hints, 1);
    }

    #[test]
    fn test_dirty_respects_nosync_hint() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();
        map.set_entry_flags(BASE, MapEntryFlags::NOSYNC, MapEntryFlags::empty())
            .unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        let page = ctx.pages.page(obj.page_lookup(0).unwrap());
        assert!(page.is_dirty());
        assert!(page.has_flags(PageFlags::NOSYNC));

        // An explicit dirty request overrides the hint
        let status = vm_fault(&ctx, &map, BASE + PG, VmProt::WRITE, FaultFlags::DIRTY);
        assert_eq!(status, KernStatus::Success);
        let page = ctx.pages.page(obj.page_lookup(1).unwrap());
        assert!(page.is_dirty());
        assert!(!page.has_flags(PageFlags::NOSYNC));
    }

    #[test]
    fn test_hold_output() {
        let (ctx, _pmap, map) = setup(16);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let (status, held) = vm_fault_hold(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
        let held = held.expect("held page returned");
        assert!(held.is_held());
        assert!(!held.is_xbusy());
        assert_eq!(obj.page_lookup(0), Some(held.page_num));
        held.unhold();
    }

    #[test]
    fn test_allocation_exhaustion_reports_shortage() {
        let (ctx, _pmap, map) = setup(2);
        let obj = ctx.objects.allocate(2);
        map.enter(BASE, BASE + 2 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        // Pin every page so nothing is allocatable or reclaimable
        let a = ctx.pages.alloc_busied().unwrap();
        let b = ctx.pages.alloc_busied().unwrap();

        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::ResourceShortage);
        assert!(ctx.counters.snapshot().oom_events >= 1);

        ctx.pages.free_page(&a);
        ctx.pages.free_page(&b);

        // With memory back, the same fault succeeds
        let status = vm_fault(&ctx, &map, BASE, VmProt::WRITE, FaultFlags::empty());
        assert_eq!(status, KernStatus::Success);
    }

    #[test]
    #[should_panic(expected = "busied and fully valid")]
    fn test_pager_contract_violation_asserts() {
        let (ctx, _pmap, map) = setup(16);
        let pager: Arc<dyn Pager> = Arc::new(BrokenPager);
        let obj = ctx
            .objects
            .allocate_with_pager(ObjectKind::Vnode, 2, pager, None);
        map.enter(BASE, BASE + 2 * PG, Some(obj), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let _ = vm_fault(&ctx, &map, BASE, VmProt::READ, FaultFlags::empty());
    }

    #[test]
    fn test_faults_on_disjoint_pages_run_concurrently() {
        let (ctx, _pmap, map) = setup(64);
        let obj = ctx.objects.allocate(8);
        map.enter(BASE, BASE + 8 * PG, Some(obj.clone()), 0, VmProt::DEFAULT, VmProt::ALL)
            .unwrap();

        let mut handles = Vec::new();
        for pindex in 0..8u64 {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                vm_fault(&ctx, &map, BASE + pindex * PG, VmProt::WRITE, FaultFlags::empty())
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), KernStatus::Success);
        }
        assert_eq!(obj.resident_page_count(), 8);
        assert_eq!(ctx.counters.snapshot().zero_fills, 8);
    }
}
