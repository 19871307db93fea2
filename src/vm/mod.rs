//! Virtual Memory Subsystem
//!
//! Provides the page-fault resolution engine and its collaborators:
//! - vm_page: physical page arena and the exclusive-busy protocol
//! - vm_object: memory objects, shadow chains, reference counting
//! - vm_map: address space maps with generation-stamped lookups
//! - pmap: hardware map abstraction (trait) and a software reference
//! - pager: external backing-store interface and vnode locking
//! - vm_pageout: allocation-pressure handling
//! - vm_fault: the fault resolution pipeline
//!
//! All mutable subsystem state hangs off a `VmContext` created by
//! `VmContext::bootstrap`; nothing lives in module-level statics, so
//! independent contexts (and tests) never interfere.

pub mod pager;
pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pageout;

pub use self::pager::{Pager, PagerResult, PopulateResult, Vnode};
pub use self::pmap::{PmapEnterFlags, PmapError, PmapOps, SoftPmap};
pub use self::vm_fault::{
    vm_fault, vm_fault_hold, vm_fault_trap, vm_fault_unwire, vm_fault_wire, FaultFlags,
    FaultSignal, KernStatus,
};
pub use self::vm_map::{MapBehavior, MapEntryFlags, MapError, VmMap, VmMapEntry, VmProt};
pub use self::vm_object::{ObjectFlags, ObjectKind, VmObject, VmObjectId};
pub use self::vm_page::{PageFlags, PageManager, VmPage, PAGE_SHIFT, PAGE_SIZE};

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::AtomicU32;
use spin::Mutex;

use crate::kern::counters::FaultCounters;
use self::vm_object::ObjectManager;

/// Which user-visible failure bounds errors translate to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrapCompat {
    /// Out-of-bounds faults raise a bus error
    #[default]
    Bsd,
    /// Out-of-bounds faults raise a segmentation violation
    Legacy,
}

type LowMemoryHook = Box<dyn Fn(&VmContext) + Send + Sync>;

/// Process-wide VM state
///
/// Owns the page arena, the object arena, and the fault counters. Every
/// fault invocation is handed a context; its counters and OOM bookkeeping
/// live and die with it.
pub struct VmContext {
    /// Physical page arena
    pub pages: PageManager,

    /// Object arena
    pub objects: ObjectManager,

    /// Fault pipeline counters
    pub counters: FaultCounters,

    /// Consecutive failed allocation attempts
    pub(crate) oom_attempts: AtomicU32,

    /// Low-memory escalation hook; defaults to inactive-queue reclaim
    low_memory_hook: Mutex<Option<LowMemoryHook>>,

    /// Signal translation mode for terminal fault outcomes
    trap_compat: Mutex<TrapCompat>,
}

impl VmContext {
    /// Bring up a VM context with an arena of `npages` pages
    pub fn bootstrap(npages: u32) -> Arc<Self> {
        Arc::new(Self {
            pages: PageManager::new(npages),
            objects: ObjectManager::new(),
            counters: FaultCounters::new(),
            oom_attempts: AtomicU32::new(0),
            low_memory_hook: Mutex::new(None),
            trap_compat: Mutex::new(TrapCompat::default()),
        })
    }

    /// Install a low-memory escalation hook
    pub fn set_low_memory_hook(&self, hook: LowMemoryHook) {
        *self.low_memory_hook.lock() = Some(hook);
    }

    /// Run the low-memory escalation
    pub(crate) fn run_low_memory(&self) {
        let hook = self.low_memory_hook.lock();
        match hook.as_ref() {
            Some(f) => f(self),
            None => {
                drop(hook);
                vm_pageout::reclaim_inactive(self, 16);
            }
        }
    }

    /// Current trap compatibility mode
    pub fn trap_compat(&self) -> TrapCompat {
        *self.trap_compat.lock()
    }

    /// Configure the trap compatibility mode
    pub fn set_trap_compat(&self, mode: TrapCompat) {
        *self.trap_compat.lock() = mode;
    }

    /// Drop a reference on `obj`, terminating it at zero
    ///
    /// Termination waits for in-flight paging to drain, frees resident
    /// pages, removes the object from the arena, and cascades one dropped
    /// reference down the backing chain.
    pub fn object_deallocate(&self, obj: &Arc<VmObject>) {
        let mut cur = Arc::clone(obj);
        loop {
            if !cur.deref_count() {
                return;
            }

            cur.set_flags(ObjectFlags::TERMINATING);
            cur.pip_wait_zero();

            for (pindex, page_num) in cur.resident_pages() {
                let page = Arc::clone(self.pages.page(page_num));
                if !page.try_xbusy() {
                    // A straggling fault still owns the page; it will
                    // observe the dead object and release it
                    continue;
                }
                cur.page_remove(pindex);
                if page.is_wired() {
                    page.xunbusy();
                    continue;
                }
                self.pages.free_page(&page);
            }

            cur.set_flags(ObjectFlags::DEAD);
            cur.clear_flags(ObjectFlags::ALIVE);
            self.objects.remove(cur.id);
            log::trace!("object {:?} terminated", cur.id);

            let Some(link) = cur.backing() else {
                return;
            };
            cur.set_backing(None);
            let Some(backing) = self.objects.lookup(link.id) else {
                return;
            };
            backing.shadow_count_dec();
            cur = backing;
        }
    }
}
