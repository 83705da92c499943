//! Kestrel kernel support library
//!
//! Lock primitives, intrusive lists, logging and the execution-environment
//! seam the scheduler is written against.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod cpu;
#[cfg(any(test, feature = "host"))]
pub mod host;
pub mod index_list;
pub mod klog;
pub mod memory;
pub mod mutex;
pub mod spinlock;

pub use cpu::{Cpu, IrqGuard};
pub use index_list::{IndexList, Link, LinkArena, NIL};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use memory::{HeapAllocator, KernelAllocator};
pub use mutex::{AnyLock, Mutex, MutexGuard, TaskRuntime};
pub use spinlock::{IrqMutex, IrqMutexGuard, Spinlock, SpinlockGuard};
