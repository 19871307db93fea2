//! Physical Map (pmap) - Hardware Page Table Abstraction
//!
//! The pmap is the hardware-facing collaborator the fault pipeline installs
//! resolved translations into. The pipeline depends only on the `PmapOps`
//! trait; TLB maintenance and page-table walking live behind it and are the
//! implementation's concern.
//!
//! Superpage support is a capability of the implementation, reported by
//! `superpage_pages()`: when present, an aligned run of that many pages may
//! be installed with a single call at a non-zero promotion index. There is
//! no fixed promotion ladder; the run length is whatever the platform says.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;
use thiserror::Error;

use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::PAGE_SIZE;

// ============================================================================
// Types
// ============================================================================

bitflags::bitflags! {
    /// Flags for `PmapOps::enter`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PmapEnterFlags: u32 {
        /// Translation must stay resident (wired mapping)
        const WIRED = 0x0001;
    }
}

/// Pmap operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    /// Translation structures could not be allocated right now
    #[error("pmap resource shortage")]
    ResourceShortage,
    /// No translation exists for the address
    #[error("address not mapped")]
    NotMapped,
}

// ============================================================================
// Pmap Interface
// ============================================================================

/// Hardware map operations consumed by the fault pipeline
pub trait PmapOps: Send + Sync {
    /// Install a translation for `vaddr` to `page_num`
    ///
    /// `psind` selects the promotion level: 0 installs a base page, 1
    /// installs a superpage run of `superpage_pages()` consecutive pages
    /// starting at an aligned `vaddr`/`page_num`.
    fn enter(
        &self,
        vaddr: u64,
        page_num: u32,
        prot: VmProt,
        flags: PmapEnterFlags,
        psind: u8,
    ) -> Result<(), PmapError>;

    /// Remove the translation for `vaddr`, if any
    fn remove(&self, vaddr: u64);

    /// Remove every translation in [start, end)
    fn remove_range(&self, start: u64, end: u64) {
        let mut addr = start & !(PAGE_SIZE as u64 - 1);
        while addr < end {
            self.remove(addr);
            addr += PAGE_SIZE as u64;
        }
    }

    /// Look up the page installed at `vaddr`
    fn extract(&self, vaddr: u64) -> Option<u32>;

    /// May the pipeline speculatively install a mapping here?
    fn is_prefaultable(&self, vaddr: u64) -> bool {
        self.extract(vaddr).is_none()
    }

    /// Clear the wired attribute on every translation in [start, end)
    fn unwire(&self, start: u64, end: u64) {
        let _ = (start, end);
    }

    /// Advise that [start, end) will not be needed soon
    fn advise_dontneed(&self, start: u64, end: u64);

    /// Superpage capability: run length in base pages, if supported
    fn superpage_pages(&self) -> Option<u64> {
        None
    }
}

// ============================================================================
// Software Pmap
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SoftEntry {
    page_num: u32,
    prot: VmProt,
    wired: bool,
    psind: u8,
}

/// Software translation table
///
/// Keeps the virtual-to-page mapping in an ordered table instead of
/// hardware page tables. Useful as the machine-independent reference
/// implementation and for exercising the pipeline on a host.
pub struct SoftPmap {
    translations: RwLock<BTreeMap<u64, SoftEntry>>,
    superpage: Option<u64>,
    superpage_installs: AtomicU64,
    dontneed_calls: AtomicU64,
}

impl SoftPmap {
    /// Create a soft pmap; `superpage` is the optional run length
    pub fn new(superpage: Option<u64>) -> Self {
        Self {
            translations: RwLock::new(BTreeMap::new()),
            superpage,
            superpage_installs: AtomicU64::new(0),
            dontneed_calls: AtomicU64::new(0),
        }
    }

    /// Number of installed translations
    pub fn resident_count(&self) -> usize {
        self.translations.read().len()
    }

    /// Number of wired translations
    pub fn wired_count(&self) -> usize {
        self.translations.read().values().filter(|e| e.wired).count()
    }

    /// Protection recorded for `vaddr`, if mapped
    pub fn prot_of(&self, vaddr: u64) -> Option<VmProt> {
        let key = vaddr & !(PAGE_SIZE as u64 - 1);
        self.translations.read().get(&key).map(|e| e.prot)
    }

    /// Is the translation for `vaddr` wired?
    pub fn is_wired(&self, vaddr: u64) -> bool {
        let key = vaddr & !(PAGE_SIZE as u64 - 1);
        self.translations
            .read()
            .get(&key)
            .map(|e| e.wired)
            .unwrap_or(false)
    }

    /// Superpage installs performed
    pub fn superpage_installs(&self) -> u64 {
        self.superpage_installs.load(Ordering::Relaxed)
    }

    /// Dont-need advisories received
    pub fn dontneed_calls(&self) -> u64 {
        self.dontneed_calls.load(Ordering::Relaxed)
    }
}

impl PmapOps for SoftPmap {
    fn enter(
        &self,
        vaddr: u64,
        page_num: u32,
        prot: VmProt,
        flags: PmapEnterFlags,
        psind: u8,
    ) -> Result<(), PmapError> {
        let wired = flags.contains(PmapEnterFlags::WIRED);
        let run = if psind == 0 {
            1
        } else {
            let Some(spp) = self.superpage else {
                return Err(PmapError::ResourceShortage);
            };
            debug_assert_eq!(vaddr % (spp * PAGE_SIZE as u64), 0, "unaligned superpage");
            self.superpage_installs.fetch_add(1, Ordering::Relaxed);
            spp
        };

        let mut translations = self.translations.write();
        for i in 0..run {
            let va = vaddr + i * PAGE_SIZE as u64;
            translations.insert(
                va,
                SoftEntry {
                    page_num: page_num + i as u32,
                    prot,
                    wired,
                    psind,
                },
            );
        }
        Ok(())
    }

    fn remove(&self, vaddr: u64) {
        let key = vaddr & !(PAGE_SIZE as u64 - 1);
        self.translations.write().remove(&key);
    }

    fn extract(&self, vaddr: u64) -> Option<u32> {
        let key = vaddr & !(PAGE_SIZE as u64 - 1);
        self.translations.read().get(&key).map(|e| e.page_num)
    }

    fn unwire(&self, start: u64, end: u64) {
        let mut translations = self.translations.write();
        for (_, entry) in translations.range_mut(start..end) {
            entry.wired = false;
        }
    }

    fn advise_dontneed(&self, start: u64, end: u64) {
        debug_assert!(start <= end);
        self.dontneed_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn superpage_pages(&self) -> Option<u64> {
        self.superpage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_extract_remove() {
        let pmap = SoftPmap::new(None);
        pmap.enter(0x4000, 7, VmProt::READ, PmapEnterFlags::empty(), 0)
            .unwrap();

        assert_eq!(pmap.extract(0x4000), Some(7));
        assert_eq!(pmap.extract(0x4123), Some(7));
        assert!(!pmap.is_prefaultable(0x4000));
        assert!(pmap.is_prefaultable(0x5000));

        pmap.remove(0x4000);
        assert_eq!(pmap.extract(0x4000), None);
    }

    #[test]
    fn test_wired_tracking() {
        let pmap = SoftPmap::new(None);
        pmap.enter(0x4000, 1, VmProt::DEFAULT, PmapEnterFlags::WIRED, 0)
            .unwrap();
        assert!(pmap.is_wired(0x4000));
        assert_eq!(pmap.wired_count(), 1);
    }

    #[test]
    fn test_superpage_run() {
        let pmap = SoftPmap::new(Some(4));
        pmap.enter(0x10000, 8, VmProt::READ, PmapEnterFlags::empty(), 1)
            .unwrap();

        assert_eq!(pmap.superpage_installs(), 1);
        assert_eq!(pmap.extract(0x10000), Some(8));
        assert_eq!(pmap.extract(0x13000), Some(11));
        assert_eq!(pmap.resident_count(), 4);
    }

    #[test]
    fn test_superpage_rejected_without_capability() {
        let pmap = SoftPmap::new(None);
        assert_eq!(
            pmap.enter(0x10000, 8, VmProt::READ, PmapEnterFlags::empty(), 1),
            Err(PmapError::ResourceShortage)
        );
    }
}
