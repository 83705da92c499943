//! The per-core idle task.
//!
//! Runs whenever a core has nothing else to do: samples the core's load,
//! halts for a while, reclaims ended tasks and offers the core back to the
//! scheduler.

use alloc::vec::Vec;

use kestrel_abi::{MemRegion, TaskId};
use kestrel_lib::{cpu, klog_debug, klog_warn};

use super::kernel::Kernel;
use super::per_core::CoreScheduler;
use super::task::Task;

impl Kernel {
    /// Body of every idle task. Never returns.
    pub fn idle_loop(&self) -> ! {
        loop {
            self.idle_iteration();
        }
    }

    /// One pass of the idle loop.
    pub fn idle_iteration(&self) {
        let Ok(core) = self.this_core() else {
            cpu::halt();
            return;
        };

        let load = core.lock().sample_load(cpu::ticks());
        let cycles = self.config.max_halt_cycles.saturating_mul(100 - load.min(100)) / 100;
        for _ in 0..cycles {
            if core.ready_total() > 0 {
                break;
            }
            cpu::halt();
        }

        self.reclaim_ending(core);
        self.schedule();
    }

    /// Drains the end list as it stands now. Tasks re-queued while draining
    /// wait for the next pass.
    pub(crate) fn reclaim_ending(&self, core: &CoreScheduler) -> usize {
        let pending = core.lock().end_len();
        let mut reclaimed = 0;
        for _ in 0..pending {
            let task = {
                let mut guard = core.lock();
                let Some(task) = guard.pop_end(&self.pool).and_then(|o| self.pool.slot(o)) else {
                    break;
                };
                if guard.fpu_owner == task.id() {
                    guard.fpu_owner = TaskId::INVALID;
                }
                task
            };
            if self.reclaim(core, task) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Frees an ended task. A process with live threads ends them first and
    /// goes back on the end list; it is freed on a later pass, after all of
    /// them.
    fn reclaim(&self, core: &CoreScheduler, task: &Task) -> bool {
        let id = task.id();
        let resources = task.resources();

        if task.flags().is_thread() {
            self.unlink_from_parent(task, resources.parent);
        } else if task.flags().is_process() {
            let children: Vec<TaskId> = {
                let children = task.children.lock();
                children
                    .iter(&self.pool.children_arena())
                    .filter_map(|offset| self.pool.slot(offset))
                    .map(Task::id)
                    .collect()
            };
            if !children.is_empty() {
                for child in &children {
                    self.end_task(*child);
                }
                core.lock().push_end(&self.pool, task);
                klog_debug!(
                    "sched: process {} waits for {} threads",
                    id,
                    children.len()
                );
                return false;
            }
            self.release_region(resources.memory);
        }

        // A join waiter that ended never completes its group.
        let awaited = task.awaited_join();
        if awaited.is_valid() && task.claim_awaited_join(awaited) {
            self.clear_join_targets(awaited);
            self.groups.release(awaited);
        }

        self.release_region(resources.stack);
        self.run_release_hook(id);
        self.pool.free(id);
        klog_debug!("sched: reclaimed task {}", id);
        true
    }

    fn unlink_from_parent(&self, task: &Task, parent_id: TaskId) {
        let unlinked = self.pool.get(parent_id).is_some_and(|parent| {
            parent
                .children
                .lock()
                .remove(&self.pool.children_arena(), task.offset())
        });
        if !unlinked {
            klog_warn!(
                "sched: thread {} missing from parent {}",
                task.id(),
                parent_id
            );
        }
    }

    fn release_region(&self, region: MemRegion) {
        if !region.is_empty() && !self.allocator.free(region) {
            klog_warn!("sched: allocator rejected region {:#x}", region.base);
        }
    }
}
