//! VM Object - Memory Object Abstraction
//!
//! VM objects represent backing store for virtual memory regions:
//! anonymous memory, pager-backed memory (file or device), and shadow
//! chains implementing copy-on-write.
//!
//! Objects live in an arena addressed by stable handles; the backing link
//! between a shadow and its backing object is a non-owning handle resolved
//! through the arena, never a traversed-to-free pointer. Reference counts
//! are explicit: map entries and shadow links each hold one reference.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, RwLock};

use crate::kern::wait::WaitFlag;
use crate::vm::pager::{Pager, Vnode};
use crate::vm::vm_page::VmPage;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object handle
    pub const NULL: Self = Self(0);
}

/// What kind of backing store an object represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Anonymous memory (zero-fill, no external handle)
    Anonymous,
    /// File-backed memory (vnode pager, vnode lock required)
    Vnode,
    /// Physically contiguous memory with a populate-capable pager
    Phys,
}

bitflags::bitflags! {
    /// VM Object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Object is alive
        const ALIVE       = 0x0001;
        /// Object teardown has begun
        const TERMINATING = 0x0002;
        /// Object teardown finished; lookups must fail
        const DEAD        = 0x0004;
        /// Object is the backing store of at least one shadow
        const SHADOWED    = 0x0008;
    }
}

/// Non-owning link from a shadow to its backing object
#[derive(Debug, Clone, Copy)]
pub struct BackingLink {
    /// Backing object handle, resolved through the arena
    pub id: VmObjectId,
    /// Page index bias applied when descending into the backing object
    pub offset_pages: u64,
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// VM Object - a unit of backing store
pub struct VmObject {
    /// Object handle
    pub id: VmObjectId,

    /// What backs this object
    pub kind: ObjectKind,

    /// Pager supplying page contents, if any
    pub pager: Option<Arc<dyn Pager>>,

    /// Backing file node, if file-backed
    pub vnode: Option<Arc<Vnode>>,

    /// Size in pages
    size_pages: AtomicU64,

    /// Object flags
    flags: AtomicU32,

    /// Reference count (map entries + shadow links)
    ref_count: AtomicU32,

    /// Number of shadows backed by this object
    shadow_count: AtomicU32,

    /// Paging-in-progress count; teardown waits for zero
    pip: AtomicU32,

    /// Sleepers waiting for paging to drain
    pip_wait: WaitFlag,

    /// Backing object link (copy-on-write chains)
    backing: Mutex<Option<BackingLink>>,

    /// Resident pages: pindex -> page number
    ///
    /// This lock is the object lock: readers may look pages up
    /// concurrently, mutation takes the write side.
    pages: RwLock<BTreeMap<u64, u32>>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ref_count", &self.ref_count())
            .field("shadow_count", &self.shadow_count())
            .finish()
    }
}

impl VmObject {
    fn new(
        id: VmObjectId,
        kind: ObjectKind,
        size_pages: u64,
        pager: Option<Arc<dyn Pager>>,
        vnode: Option<Arc<Vnode>>,
    ) -> Self {
        Self {
            id,
            kind,
            pager,
            vnode,
            size_pages: AtomicU64::new(size_pages),
            flags: AtomicU32::new(ObjectFlags::ALIVE.bits()),
            ref_count: AtomicU32::new(1),
            shadow_count: AtomicU32::new(0),
            pip: AtomicU32::new(0),
            pip_wait: WaitFlag::new(),
            backing: Mutex::new(None),
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get object size in pages
    pub fn size_pages(&self) -> u64 {
        self.size_pages.load(Ordering::SeqCst)
    }

    /// Get object flags
    pub fn get_flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set object flags
    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear object flags
    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Teardown has completed; the object must not satisfy faults
    pub fn is_dead(&self) -> bool {
        self.get_flags().contains(ObjectFlags::DEAD)
    }

    /// Teardown has begun but not finished
    pub fn is_terminating(&self) -> bool {
        let flags = self.get_flags();
        flags.contains(ObjectFlags::TERMINATING) && !flags.contains(ObjectFlags::DEAD)
    }

    /// Anonymous objects have no external handle
    pub fn is_anonymous(&self) -> bool {
        self.kind == ObjectKind::Anonymous && self.vnode.is_none()
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Increment reference count
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement reference count, returns true if this was the last
    pub(crate) fn deref_count(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Get reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Get shadow count
    pub fn shadow_count(&self) -> u32 {
        self.shadow_count.load(Ordering::SeqCst)
    }

    pub(crate) fn shadow_count_inc(&self) {
        self.shadow_count.fetch_add(1, Ordering::SeqCst);
        self.set_flags(ObjectFlags::SHADOWED);
    }

    pub(crate) fn shadow_count_dec(&self) {
        if self.shadow_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.clear_flags(ObjectFlags::SHADOWED);
        }
    }

    // ------------------------------------------------------------------
    // Paging in progress
    //
    // Holding a paging reference prevents the object from being torn
    // down or truncated under an in-flight fault.
    // ------------------------------------------------------------------

    /// Add a paging-in-progress reference
    pub fn pip_add(&self) {
        self.pip.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a paging-in-progress reference, waking drain waiters at zero
    pub fn pip_wakeup(&self) {
        let prev = self.pip.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "pip underflow");
        if prev == 1 {
            self.pip_wait.wake();
        }
    }

    /// Current paging-in-progress count
    pub fn pip_count(&self) -> u32 {
        self.pip.load(Ordering::SeqCst)
    }

    /// Wait until no paging operation is in flight
    pub fn pip_wait_zero(&self) {
        self.pip_wait.sleep_while(|| self.pip_count() != 0);
    }

    // ------------------------------------------------------------------
    // Backing chain
    // ------------------------------------------------------------------

    /// Get the backing link, if any
    pub fn backing(&self) -> Option<BackingLink> {
        *self.backing.lock()
    }

    pub(crate) fn set_backing(&self, link: Option<BackingLink>) {
        *self.backing.lock() = link;
    }

    // ------------------------------------------------------------------
    // Resident pages
    // ------------------------------------------------------------------

    /// Lookup a resident page
    pub fn page_lookup(&self, pindex: u64) -> Option<u32> {
        self.pages.read().get(&pindex).copied()
    }

    /// Insert a page, failing if the slot is already occupied
    ///
    /// Occupancy is how concurrent faults racing to allocate the same slot
    /// are resolved: the loser frees its page and sleeps on the winner's.
    pub fn page_insert(&self, pindex: u64, page: &Arc<VmPage>) -> Result<(), u32> {
        let mut pages = self.pages.write();
        if let Some(&existing) = pages.get(&pindex) {
            return Err(existing);
        }
        pages.insert(pindex, page.page_num);
        drop(pages);
        page.set_owner(self.id, pindex);
        Ok(())
    }

    /// Remove a page from this object
    pub fn page_remove(&self, pindex: u64) -> Option<u32> {
        self.pages.write().remove(&pindex)
    }

    /// Get resident page count
    pub fn resident_page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Snapshot of all resident (pindex, page number) pairs
    pub fn resident_pages(&self) -> Vec<(u64, u32)> {
        self.pages.read().iter().map(|(&k, &v)| (k, v)).collect()
    }

    /// Access the object lock directly (copy-on-write upgrade path)
    pub(crate) fn pages_lock(&self) -> &RwLock<BTreeMap<u64, u32>> {
        &self.pages
    }
}

// ============================================================================
// Object Arena
// ============================================================================

/// VM object arena
///
/// Allocates handles and owns every live object. Lookups by handle are how
/// back-links are resolved; removing an object from the arena is the final
/// step of termination.
pub struct ObjectManager {
    objects: Mutex<BTreeMap<VmObjectId, Arc<VmObject>>>,
    next_id: AtomicU64,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> VmObjectId {
        VmObjectId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocate an anonymous object
    pub fn allocate(&self, size_pages: u64) -> Arc<VmObject> {
        self.insert(ObjectKind::Anonymous, size_pages, None, None)
    }

    /// Allocate an object backed by a pager
    pub fn allocate_with_pager(
        &self,
        kind: ObjectKind,
        size_pages: u64,
        pager: Arc<dyn Pager>,
        vnode: Option<Arc<Vnode>>,
    ) -> Arc<VmObject> {
        self.insert(kind, size_pages, Some(pager), vnode)
    }

    fn insert(
        &self,
        kind: ObjectKind,
        size_pages: u64,
        pager: Option<Arc<dyn Pager>>,
        vnode: Option<Arc<Vnode>>,
    ) -> Arc<VmObject> {
        let id = self.next_id();
        let obj = Arc::new(VmObject::new(id, kind, size_pages, pager, vnode));
        self.objects.lock().insert(id, Arc::clone(&obj));
        obj
    }

    /// Create a shadow of `source` for copy-on-write
    ///
    /// The shadow starts empty; unresolved lookups descend into `source`
    /// at `offset_pages`. The shadow holds one reference on the source.
    pub fn shadow(
        &self,
        source: &Arc<VmObject>,
        offset_pages: u64,
        size_pages: u64,
    ) -> Arc<VmObject> {
        let shadow = self.insert(ObjectKind::Anonymous, size_pages, None, None);
        source.reference();
        source.shadow_count_inc();
        shadow.set_backing(Some(BackingLink {
            id: source.id,
            offset_pages,
        }));
        shadow
    }

    /// Look up an object by handle
    pub fn lookup(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        self.objects.lock().get(&id).cloned()
    }

    /// Unlink a terminated object from the arena
    pub(crate) fn remove(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        self.objects.lock().remove(&id)
    }

    /// Number of live objects in the arena
    pub fn live_count(&self) -> usize {
        self.objects.lock().len()
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_creation() {
        let arena = ObjectManager::new();
        let obj = arena.allocate(4);
        assert!(obj.get_flags().contains(ObjectFlags::ALIVE));
        assert!(obj.is_anonymous());
        assert_eq!(obj.size_pages(), 4);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(arena.lookup(obj.id).unwrap().id, obj.id);
    }

    #[test]
    fn test_shadow_links() {
        let arena = ObjectManager::new();
        let backing = arena.allocate(8);
        let shadow = arena.shadow(&backing, 2, 4);

        assert_eq!(backing.ref_count(), 2);
        assert_eq!(backing.shadow_count(), 1);
        assert!(backing.get_flags().contains(ObjectFlags::SHADOWED));

        let link = shadow.backing().unwrap();
        assert_eq!(link.id, backing.id);
        assert_eq!(link.offset_pages, 2);
    }

    #[test]
    fn test_page_insert_collision() {
        let arena = ObjectManager::new();
        let pages = crate::vm::vm_page::PageManager::new(4);
        let obj = arena.allocate(4);

        let a = pages.alloc_busied().unwrap();
        let b = pages.alloc_busied().unwrap();

        assert!(obj.page_insert(0, &a).is_ok());
        assert_eq!(obj.page_insert(0, &b), Err(a.page_num));
        assert_eq!(obj.page_lookup(0), Some(a.page_num));
        assert_eq!(obj.resident_page_count(), 1);
    }

    #[test]
    fn test_pip_drain() {
        let arena = ObjectManager::new();
        let obj = arena.allocate(1);
        obj.pip_add();
        obj.pip_add();
        assert_eq!(obj.pip_count(), 2);
        obj.pip_wakeup();
        obj.pip_wakeup();
        obj.pip_wait_zero();
        assert_eq!(obj.pip_count(), 0);
    }
}
