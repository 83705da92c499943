//! SMP task scheduler.
//!
//! Per-core run queues with quota-based priority selection, a shared wait
//! list, validated cross-core lookup, submission-time load balancing, lazy
//! FPU switching, wait/join groups and idle-time reclamation. All of it
//! hangs off one [`Kernel`] value.

mod common;
mod fpu;
mod group_id;
mod groups;
mod idle;
mod kernel;
mod lifecycle;
mod load_balance;
mod lookup;
mod per_core;
mod switch;
mod task;
mod task_pool;

#[cfg(test)]
mod sched_tests;

pub use common::CommonScheduler;
pub use group_id::GroupIdAllocator;
pub use kernel::{Kernel, ReleaseHook, exit_current_task, init, kernel};
pub use per_core::{CoreGuard, CoreScheduler, CoreState};
pub use task::{Residence, Task, TaskResources};
pub use task_pool::TaskPool;
