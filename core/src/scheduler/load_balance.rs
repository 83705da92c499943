//! Placement of runnable tasks across cores.
//!
//! A task is balanced only at the moment it is (re)submitted: on creation,
//! on wake-up and when an interrupt-driven switch preempts it. There is no
//! periodic rebalancing pass. A task re-pinned to another core also moves
//! when it next leaves its current core voluntarily.

use kestrel_abi::{Affinity, TaskId};
use kestrel_lib::{cpu, klog_debug};

use super::kernel::Kernel;
use super::per_core::CoreGuard;
use super::task::{Residence, Task};

impl Kernel {
    /// Core a task submitted from `source` should land on.
    ///
    /// Pinned tasks go to their core. Unpinned tasks stay on the source
    /// unless balancing is on there and another core's ready list for the
    /// task's priority is shorter by at least the balancing threshold; the
    /// shortest such list wins.
    pub(crate) fn balance_target(&self, task: &Task, source: &CoreGuard<'_>) -> usize {
        let source_index = source.index();
        match task.affinity() {
            Affinity::Core(core) if (core as usize) < self.cores.len() => core as usize,
            Affinity::Core(_) => source_index,
            Affinity::Any if !source.scheduler().balancing() => source_index,
            Affinity::Any => {
                let priority = task.priority();
                let source_len = source.ready_len(priority);
                let threshold = self.config.balance_threshold;
                self.cores
                    .iter()
                    .filter(|core| core.index() != source_index)
                    .map(|core| (core.index(), core.ready_len(priority)))
                    .filter(|&(_, len)| len + threshold <= source_len)
                    .min_by_key(|&(_, len)| len)
                    .map_or(source_index, |(index, _)| index)
            }
        }
    }

    /// Queues `task`, whose core lock `source` is held, on the core chosen by
    /// [`Kernel::balance_target`]. Consumes the source lock: at most one core
    /// lock is held at any time.
    ///
    /// A task whose registers are still live in the source core's FPU only
    /// migrates if that core is the caller's, in which case the registers
    /// are saved into the task first. That save is the only point where a
    /// migration persists FPU state.
    pub(crate) fn submit(&self, task: &Task, mut source: CoreGuard<'_>) {
        let source_index = source.index();
        let mut target_index = self.balance_target(task, &source);

        if target_index != source_index && source.fpu_owner == task.id() {
            if source_index == cpu::current_core() {
                // SAFETY: the source lock covers the task's FPU area.
                cpu::save_fpu(unsafe { task.fpu_area() });
                task.set_fpu_used(true);
                source.fpu_owner = TaskId::INVALID;
            } else {
                klog_debug!(
                    "sched: task {} keeps core {} while its FPU state is live there",
                    task.id(),
                    source_index
                );
                target_index = source_index;
            }
        }

        if target_index == source_index {
            self.add_task_to_ready_list(&mut source, task);
            return;
        }

        // Lookups that race the hand-over find the task detached on the
        // target core and leave it to the routing below.
        task.set_core(target_index);
        drop(source);

        let Ok(target) = self.core(target_index) else {
            return;
        };
        let mut guard = target.lock();
        self.add_task_to_ready_list(&mut guard, task);
        klog_debug!(
            "sched: migrated task {} core {} -> {}",
            task.id(),
            source_index,
            target_index
        );
    }

    /// Whether `task` is pinned to an existing core other than `core`.
    pub(crate) fn pinned_elsewhere(&self, task: &Task, core: usize) -> bool {
        task.affinity()
            .core()
            .is_some_and(|pinned| pinned != core && pinned < self.cores.len())
    }

    /// Moves a ready task queued on the caller's core to the core it is
    /// pinned to. The caller's core is the source, so live FPU registers
    /// are saved on the way out.
    pub(crate) fn move_to_pinned_core(&self, id: TaskId) {
        let Ok((task, mut guard)) = self.lock_task_core(id) else {
            return;
        };
        let here = guard.index();
        if task.residence() != Residence::Ready(here) || !self.pinned_elsewhere(task, here) {
            return;
        }
        if guard.remove_ready(&self.pool, task) {
            self.submit(task, guard);
        }
    }
}
