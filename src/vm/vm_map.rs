//! VM Map - Address Space Management
//!
//! VM maps represent the virtual address space of a task as a set of
//! entries ordered by start address. The fault pipeline consumes two
//! operations here: `fault_lookup`, which resolves a faulting address into
//! an entry snapshot plus the first object of its shadow chain, and
//! `fault_relookup`, which re-validates that snapshot after the fault
//! dropped map validity (pager calls, sleeps).
//!
//! Concurrent modification is detected with a monotonically increasing
//! generation stamp: every structural change bumps it, and a fault whose
//! stamp went stale must re-validate before committing a mapping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::RwLock;
use thiserror::Error;

use crate::kern::wait::WaitFlag;
use crate::vm::pmap::PmapOps;
use crate::vm::vm_object::VmObject;
use crate::vm::vm_page::{PAGE_SHIFT, PAGE_SIZE};
use crate::vm::VmContext;

// ============================================================================
// Protection
// ============================================================================

bitflags::bitflags! {
    /// Memory protection and fault access bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Read access
        const READ    = 0x1;
        /// Write access
        const WRITE   = 0x2;
        /// Execute access
        const EXECUTE = 0x4;
        /// Pseudo-access: force a private copy even without a write
        const COPY    = 0x8;
    }
}

impl VmProt {
    /// Default protection (read/write)
    pub const DEFAULT: Self = Self::READ.union(Self::WRITE);
    /// All real permissions
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// The real access bits, with the copy pseudo-bit masked off
    pub fn access_bits(self) -> Self {
        self.difference(Self::COPY)
    }
}

// ============================================================================
// Map Entry
// ============================================================================

bitflags::bitflags! {
    /// Map entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapEntryFlags: u32 {
        /// Entry is mid-transition (wiring or copy setup by another thread)
        const IN_TRANSITION = 0x0001;
        /// A sleeper wants a wakeup when the transition ends
        const NEEDS_WAKEUP  = 0x0002;
        /// First write must allocate a private shadow object
        const NEEDS_COPY    = 0x0004;
        /// Do not schedule write-back for pages dirtied through this entry
        const NOSYNC        = 0x0008;
    }
}

/// Expected access pattern for an entry, set by madvise-style hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapBehavior {
    /// No declared pattern; the adaptive read-ahead window applies
    #[default]
    Normal,
    /// Sequential access: maximum read-ahead
    Sequential,
    /// Random access: read-ahead disabled
    Random,
}

/// VM Map Entry - a single mapping in the address space
#[derive(Debug)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: u64,

    /// End address of this entry
    pub end: u64,

    /// First object of the shadow chain backing this entry
    pub object: Option<Arc<VmObject>>,

    /// Byte offset into the object
    pub offset: u64,

    /// Protection (current)
    pub protection: VmProt,

    /// Maximum protection
    pub max_protection: VmProt,

    /// Entry flags
    pub flags: MapEntryFlags,

    /// Wire count
    pub wired_count: u32,

    /// Declared access pattern
    pub behavior: MapBehavior,

    /// Read-ahead hint: next expected sequential fault address
    ///
    /// Updated under the map read lock; the stamp does not change.
    pub next_read: AtomicU64,

    /// Read-ahead hint: current adaptive window length in pages
    pub read_ahead: AtomicU32,
}

impl VmMapEntry {
    pub fn new(start: u64, end: u64, object: Option<Arc<VmObject>>, offset: u64) -> Self {
        Self {
            start,
            end,
            object,
            offset,
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            flags: MapEntryFlags::empty(),
            wired_count: 0,
            behavior: MapBehavior::Normal,
            next_read: AtomicU64::new(0),
            read_ahead: AtomicU32::new(0),
        }
    }

    /// Get entry size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if this entry overlaps with a range
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Page index within the entry's object for a faulting address
    pub fn pindex_of(&self, vaddr: u64) -> u64 {
        (vaddr - self.start + self.offset) >> PAGE_SHIFT
    }

    /// Virtual address of a page index within this entry
    pub fn vaddr_of(&self, pindex: u64) -> u64 {
        self.start + ((pindex << PAGE_SHIFT) as u64 - self.offset)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// VM map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Address not covered by any entry
    #[error("address not mapped")]
    InvalidAddress,
    /// Requested access exceeds the entry protection
    #[error("protection failure")]
    ProtectionFailure,
    /// Entry is mid-transition; release and retry
    #[error("entry in transition")]
    InTransition,
    /// Requested range is malformed or outside the map
    #[error("invalid range")]
    InvalidRange,
    /// Requested range collides with an existing entry
    #[error("no space in map")]
    NoSpace,
    /// No entry found in the requested range
    #[error("entry not found")]
    NotFound,
}

// ============================================================================
// Fault Lookup
// ============================================================================

/// Snapshot handed to the fault pipeline by `fault_lookup`
#[derive(Debug, Clone)]
pub struct FaultLookup {
    /// Entry bounds, for prefault and read-ahead clamping
    pub entry_start: u64,
    pub entry_end: u64,
    /// First object of the chain (caller manages references)
    pub object: Arc<VmObject>,
    /// Page index of the faulting address within the object
    pub pindex: u64,
    /// Effective protection for the mapping to install
    pub prot: VmProt,
    /// Entry is wired; the resolved page must be wired too
    pub wired: bool,
    /// Entry requests no write-back scheduling
    pub nosync: bool,
    /// Declared access pattern
    pub behavior: MapBehavior,
    /// Map generation at snapshot time
    pub generation: u64,
}

/// Result of re-validating a fault's map snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relookup {
    /// Stamp unchanged: the snapshot is still exact
    Unchanged,
    /// Map changed compatibly; protection narrowed to the intersection
    Revalidated { prot: VmProt, generation: u64 },
    /// Map changed incompatibly; the fault must restart from the top
    Restart,
}

// ============================================================================
// VM Map
// ============================================================================

/// VM Map - a task's address space
pub struct VmMap {
    /// Minimum mappable address
    pub min_offset: u64,

    /// Maximum mappable address
    pub max_offset: u64,

    /// Hardware map translations are installed into
    pub pmap: Arc<dyn PmapOps>,

    /// Map entries (ordered by start address)
    entries: RwLock<BTreeMap<u64, VmMapEntry>>,

    /// Modification stamp
    generation: AtomicU64,

    /// Sleepers waiting for an entry transition to end
    transition_wait: WaitFlag,
}

impl VmMap {
    /// Create a new VM map over [min, max)
    pub fn new(min: u64, max: u64, pmap: Arc<dyn PmapOps>) -> Self {
        Self {
            min_offset: min,
            max_offset: max,
            pmap,
            entries: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(1),
            transition_wait: WaitFlag::new(),
        }
    }

    /// Current modification stamp
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Fault-side operations
    // ------------------------------------------------------------------

    /// Resolve a faulting address into its entry and first object
    ///
    /// A write or copy fault against a needs-copy entry allocates the
    /// private shadow object here, so the pipeline always receives the
    /// object it will ultimately install from.
    pub fn fault_lookup(
        &self,
        ctx: &VmContext,
        vaddr: u64,
        fault_type: VmProt,
    ) -> Result<FaultLookup, MapError> {
        loop {
            let entries = self.entries.read();
            let entry = Self::entry_for(&entries, vaddr).ok_or(MapError::InvalidAddress)?;

            if entry.flags.contains(MapEntryFlags::IN_TRANSITION) {
                return Err(MapError::InTransition);
            }
            if !entry.protection.contains(fault_type.access_bits()) {
                return Err(MapError::ProtectionFailure);
            }

            let needs_copy = entry.flags.contains(MapEntryFlags::NEEDS_COPY);
            let is_write = fault_type.intersects(VmProt::WRITE | VmProt::COPY);
            if needs_copy && is_write {
                let entry_start = entry.start;
                drop(entries);
                self.entry_shadow(ctx, entry_start);
                continue;
            }

            let object = entry.object.clone().ok_or(MapError::InvalidAddress)?;
            let mut prot = entry.protection;
            if needs_copy {
                // Reads through an unresolved copy entry must not create
                // writable mappings to the shared backing pages
                prot.remove(VmProt::WRITE);
            }

            return Ok(FaultLookup {
                entry_start: entry.start,
                entry_end: entry.end,
                pindex: entry.pindex_of(vaddr),
                prot,
                wired: entry.wired_count > 0,
                nosync: entry.flags.contains(MapEntryFlags::NOSYNC),
                behavior: entry.behavior,
                generation: self.generation(),
                object,
            });
        }
    }

    /// Re-validate a fault's snapshot after map validity was dropped
    pub fn fault_relookup(
        &self,
        vaddr: u64,
        fault_type: VmProt,
        object: &Arc<VmObject>,
        pindex: u64,
        old_generation: u64,
    ) -> Relookup {
        if self.generation() == old_generation {
            return Relookup::Unchanged;
        }

        let entries = self.entries.read();
        let Some(entry) = Self::entry_for(&entries, vaddr) else {
            return Relookup::Restart;
        };
        if entry.flags.contains(MapEntryFlags::IN_TRANSITION) {
            return Relookup::Restart;
        }
        let Some(cur) = entry.object.as_ref() else {
            return Relookup::Restart;
        };
        if cur.id != object.id || entry.pindex_of(vaddr) != pindex {
            return Relookup::Restart;
        }
        if entry.flags.contains(MapEntryFlags::NEEDS_COPY)
            && fault_type.intersects(VmProt::WRITE | VmProt::COPY)
        {
            return Relookup::Restart;
        }

        let mut prot = entry.protection;
        if entry.flags.contains(MapEntryFlags::NEEDS_COPY) {
            prot.remove(VmProt::WRITE);
        }
        if !prot.contains(fault_type.access_bits()) || prot.is_empty() {
            return Relookup::Restart;
        }

        Relookup::Revalidated {
            prot,
            generation: self.generation(),
        }
    }

    /// Sleep until the map signals the end of an entry transition
    pub fn sleep_transition(&self, observed_generation: u64) {
        self.transition_wait
            .sleep_while(|| self.generation() == observed_generation);
    }

    /// End an entry transition: clear the flag and wake sleepers
    pub fn clear_in_transition(&self, entry_start: u64) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&entry_start).ok_or(MapError::NotFound)?;
        entry.flags.remove(MapEntryFlags::IN_TRANSITION | MapEntryFlags::NEEDS_WAKEUP);
        drop(entries);
        self.bump_generation();
        self.transition_wait.wake();
        Ok(())
    }

    /// Mark an entry in transition (wiring setup path)
    pub fn set_in_transition(&self, entry_start: u64) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&entry_start).ok_or(MapError::NotFound)?;
        entry.flags.insert(MapEntryFlags::IN_TRANSITION);
        drop(entries);
        self.bump_generation();
        Ok(())
    }

    /// Replace a needs-copy entry's object with a fresh shadow
    fn entry_shadow(&self, ctx: &VmContext, entry_start: u64) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&entry_start) else {
            return;
        };
        if !entry.flags.contains(MapEntryFlags::NEEDS_COPY) {
            // Another fault resolved the copy while we waited for the lock
            return;
        }
        let Some(source) = entry.object.clone() else {
            return;
        };

        let size_pages = (entry.size() as usize / PAGE_SIZE) as u64;
        let shadow = ctx
            .objects
            .shadow(&source, entry.offset >> PAGE_SHIFT, size_pages);
        log::debug!(
            "entry {:#x}: shadowing object {:?} with {:?}",
            entry_start,
            source.id,
            shadow.id
        );

        entry.object = Some(shadow);
        entry.offset = 0;
        entry.flags.remove(MapEntryFlags::NEEDS_COPY);
        drop(entries);

        // The entry's reference moved to the shadow; drop the one it held
        // on the source (the shadow link took its own)
        ctx.object_deallocate(&source);
        self.bump_generation();
    }

    // ------------------------------------------------------------------
    // Entry access helpers
    // ------------------------------------------------------------------

    fn entry_for<'a>(
        entries: &'a BTreeMap<u64, VmMapEntry>,
        vaddr: u64,
    ) -> Option<&'a VmMapEntry> {
        entries
            .range(..=vaddr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(vaddr))
    }

    /// Run `f` against the entry starting at `entry_start`
    ///
    /// Used by the pipeline to update per-entry read-ahead hints, which
    /// only need the read side of the map lock.
    pub fn with_entry<R>(&self, entry_start: u64, f: impl FnOnce(&VmMapEntry) -> R) -> Option<R> {
        let entries = self.entries.read();
        entries.get(&entry_start).map(f)
    }

    /// Find the entry covering `vaddr` and return its start address
    pub fn lookup_entry(&self, vaddr: u64) -> Option<u64> {
        let entries = self.entries.read();
        Self::entry_for(&entries, vaddr).map(|e| e.start)
    }

    // ------------------------------------------------------------------
    // Map management
    // ------------------------------------------------------------------

    /// Enter a new mapping
    ///
    /// Takes over one reference on `object`.
    pub fn enter(
        &self,
        start: u64,
        end: u64,
        object: Option<Arc<VmObject>>,
        offset: u64,
        protection: VmProt,
        max_protection: VmProt,
    ) -> Result<(), MapError> {
        if start >= end || start < self.min_offset || end > self.max_offset {
            return Err(MapError::InvalidRange);
        }

        let mut entries = self.entries.write();
        if entries.values().any(|e| e.overlaps(start, end)) {
            return Err(MapError::NoSpace);
        }

        let mut entry = VmMapEntry::new(start, end, object, offset);
        entry.protection = protection;
        entry.max_protection = max_protection;
        entries.insert(start, entry);
        drop(entries);

        self.bump_generation();
        Ok(())
    }

    /// Remove all entries fully contained in [start, end)
    pub fn remove(&self, ctx: &VmContext, start: u64, end: u64) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        let keys: Vec<u64> = entries
            .values()
            .filter(|e| e.start >= start && e.end <= end)
            .map(|e| e.start)
            .collect();
        if keys.is_empty() {
            return Err(MapError::NotFound);
        }

        let mut removed = Vec::new();
        for key in keys {
            if let Some(entry) = entries.remove(&key) {
                self.pmap.remove_range(entry.start, entry.end);
                removed.push(entry);
            }
        }
        drop(entries);

        for entry in removed {
            if let Some(obj) = entry.object {
                ctx.object_deallocate(&obj);
            }
        }
        self.bump_generation();
        Ok(())
    }

    /// Change protection on every entry overlapping [start, end)
    pub fn protect(&self, start: u64, end: u64, new_prot: VmProt) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            if entry.overlaps(start, end) {
                if !entry.max_protection.contains(new_prot) {
                    return Err(MapError::ProtectionFailure);
                }
                entry.protection = new_prot;
            }
        }
        drop(entries);
        self.bump_generation();
        Ok(())
    }

    /// Adjust wired counts on entries overlapping [start, end)
    pub(crate) fn adjust_wired(&self, start: u64, end: u64, delta: i32) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            if entry.overlaps(start, end) {
                if delta > 0 {
                    entry.wired_count += delta as u32;
                } else {
                    entry.wired_count = entry.wired_count.saturating_sub((-delta) as u32);
                }
            }
        }
        drop(entries);
        self.bump_generation();
    }

    /// Declare an access pattern for the entry starting at `entry_start`
    pub fn set_behavior(&self, entry_start: u64, behavior: MapBehavior) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&entry_start).ok_or(MapError::NotFound)?;
        entry.behavior = behavior;
        Ok(())
    }

    /// Set or clear entry flags (copy setup, write-back hints)
    pub fn set_entry_flags(
        &self,
        entry_start: u64,
        set: MapEntryFlags,
        clear: MapEntryFlags,
    ) -> Result<(), MapError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&entry_start).ok_or(MapError::NotFound)?;
        entry.flags.insert(set);
        entry.flags.remove(clear);
        Ok(())
    }

    /// Find free space of at least `size` bytes
    pub fn find_space(&self, size: u64) -> Option<u64> {
        let entries = self.entries.read();
        let mut prev_end = self.min_offset;
        for entry in entries.values() {
            if prev_end + size <= entry.start {
                return Some(prev_end);
            }
            prev_end = entry.end;
        }
        if prev_end + size <= self.max_offset {
            return Some(prev_end);
        }
        None
    }
}
