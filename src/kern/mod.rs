//! Kernel Support Primitives
//!
//! Small building blocks shared by the VM subsystem:
//! - counters: atomically updated event counters
//! - wait: cooperative sleep/wakeup flags for the busy protocols

pub mod counters;
pub mod wait;

pub use self::counters::{FaultCounters, FaultStatsSnapshot, VmCounter};
pub use self::wait::WaitFlag;
