//! Validated cross-core task lookup.
//!
//! A task's owning core can change between reading it and locking that
//! core. The lookup locks the core it read, re-reads, and retries until the
//! two agree, so a caller holding the returned guard may touch the task.

use kestrel_abi::TaskId;
use kestrel_lib::klog_trace;

use super::kernel::Kernel;
use super::per_core::CoreGuard;
use super::task::Task;
use crate::error::{SchedError, SchedResult};

impl Kernel {
    /// Resolves `id` and locks the core that currently owns it.
    pub(crate) fn lock_task_core(&self, id: TaskId) -> SchedResult<(&Task, CoreGuard<'_>)> {
        loop {
            let task = self.task(id)?;
            let core_index = task.core();
            let guard = self.core(core_index)?.lock();
            if task.id() != id {
                return Err(SchedError::StaleTask { id });
            }
            if task.core() == core_index {
                return Ok((task, guard));
            }
            drop(guard);
            klog_trace!(
                "sched: task {} left core {} during lookup, retrying",
                id,
                core_index
            );
        }
    }

    /// Takes a task off one of `core`'s ready lists.
    pub fn remove_task_from_ready_list(&self, core: usize, id: TaskId) -> bool {
        let result = self.core(core).and_then(|scheduler| {
            let task = self.task(id)?;
            let mut guard = scheduler.lock();
            if guard.remove_ready(&self.pool, task) {
                Ok(())
            } else {
                Err(SchedError::WrongState { id })
            }
        });
        self.settle("remove_task_from_ready_list", result)
    }
}
