//! VM_R - A Rust implementation of the BSD virtual-memory fault pipeline
//!
//! This crate provides the page-fault resolution engine of a BSD-style
//! virtual memory system: given a faulting address, an access type, and a
//! map describing the address space, it locates or creates the backing
//! physical page (zero-fill, pager-backed, or copy-on-write), installs the
//! translation through the pmap abstraction, and returns a definitive
//! outcome — while permitting other threads to fault concurrently on
//! overlapping or disjoint regions.
//!
//! The crate is `no_std` + `alloc`; host tests run under std and exercise
//! the concurrency protocols with real threads.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Kernel support primitives
pub mod kern;

// Virtual memory subsystem
pub mod vm;

pub use crate::vm::vm_fault::{
    vm_fault, vm_fault_hold, vm_fault_trap, vm_fault_unwire, vm_fault_wire, FaultFlags,
    FaultSignal, KernStatus,
};
pub use crate::vm::VmContext;
