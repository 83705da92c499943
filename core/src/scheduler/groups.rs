//! Wait groups and join groups.
//!
//! A wait group is a condition: tasks park on a group id and are woken one
//! at a time or all together. A join group is a countdown latch: one waiter
//! sleeps until a given number of its targets have ended.
//!
//! The side that wakes a task also clears its group fields and releases the
//! join group id, so a woken task finds nothing left to tidy up.

use alloc::vec::Vec;

use kestrel_abi::{GroupId, TaskId, TaskKind, TaskState};
use kestrel_lib::{AnyLock, IrqGuard, klog_debug};

use super::kernel::Kernel;
use super::task::{Residence, Task};
use crate::error::{SchedError, SchedResult};

impl Kernel {
    // =========================================================================
    // Wait groups
    // =========================================================================

    /// Parks the calling task on `group`, releasing `lock` while asleep and
    /// re-acquiring it after the wake-up.
    pub fn wait_group(&self, group: GroupId, lock: AnyLock<'_>) -> bool {
        // A preemption between flagging and releasing `lock` would park the
        // task with the lock still held.
        let irq = IrqGuard::new();
        let result = self.park_on(group);
        if !self.settle("wait_group", result) {
            return false;
        }
        lock.release(self);
        self.schedule();
        drop(irq);
        lock.acquire(self);
        true
    }

    pub(crate) fn park_on(&self, group: GroupId) -> SchedResult {
        if !group.is_valid() {
            return Err(SchedError::InvalidGroup);
        }
        let task = self.current_task()?;
        let _guard = self.this_core()?.lock();
        if task.is_idle() {
            return Err(SchedError::IdleTask { id: task.id() });
        }
        // Waiting first: a notifier that sees the group can always wake.
        task.set_state(TaskState::Waiting);
        task.set_wait_group(group);
        Ok(())
    }

    /// Wakes the longest-parked task of `group`.
    pub fn notify_one_in_wait_group(&self, group: GroupId) -> bool {
        self.wait_group_candidates(group)
            .into_iter()
            .any(|id| self.claim_and_wake(id, group))
    }

    /// Wakes every task of `group`; `true` if there was at least one.
    pub fn notify_all_in_wait_group(&self, group: GroupId) -> bool {
        self.wait_group_candidates(group)
            .into_iter()
            .filter(|&id| self.claim_and_wake(id, group))
            .count()
            > 0
    }

    /// Parked waiters in wait-list order, then tasks that flagged themselves
    /// waiting but have not reached the scheduler yet.
    fn wait_group_candidates(&self, group: GroupId) -> Vec<TaskId> {
        if !group.is_valid() {
            return Vec::new();
        }
        let mut candidates = self.common.waiters_of(&self.pool, group);
        candidates.extend(
            self.pool
                .live()
                .filter(|task| task.wait_group() == group)
                .filter(|task| task.residence() != Residence::Waiting)
                .map(Task::id),
        );
        candidates
    }

    fn claim_and_wake(&self, id: TaskId, group: GroupId) -> bool {
        match self.pool.get(id) {
            Some(task) if task.claim_wait_group(group) => self.notify_task(id),
            _ => false,
        }
    }

    // =========================================================================
    // Join groups
    // =========================================================================

    /// Sleeps until `count` of `targets` have ended. A count larger than the
    /// target list waits for all of them.
    ///
    /// Every target that cannot be stamped (stale, idle, ending, already a
    /// target elsewhere) counts as ended at once. The waiter holds a guard
    /// on the countdown while stamping and stays runnable until it drops it,
    /// so no ending can complete the join before the waiter is set up.
    pub fn join_group(&self, targets: &[TaskId], count: usize) -> bool {
        let _irq = IrqGuard::new();
        let result = self.start_join(targets, count);
        if !self.settle("join_group", result) {
            return false;
        }
        self.schedule();
        true
    }

    fn start_join(&self, targets: &[TaskId], count: usize) -> SchedResult {
        let waiter = self.current_task()?;
        if waiter.is_idle() {
            return Err(SchedError::IdleTask { id: waiter.id() });
        }
        if waiter.awaited_join().is_valid() {
            return Err(SchedError::WrongState { id: waiter.id() });
        }
        let group = self.groups.allocate()?;

        let core = self.this_core()?;
        {
            let _guard = core.lock();
            waiter.arm_join(count.min(targets.len()) as u32);
            waiter.set_awaited_join(group);
        }

        for &id in targets {
            if !self.stamp_join_target(id, waiter, group) {
                waiter.consume_join_unit();
            }
        }
        klog_debug!(
            "sched: task {} joins {} of {} targets on {:?}",
            waiter.id(),
            count,
            targets.len(),
            group
        );

        {
            // A disband may already have completed the join.
            let _guard = core.lock();
            if waiter.awaited_join() == group {
                waiter.set_state(TaskState::Waiting);
            }
        }
        if waiter.release_join_guard() {
            self.complete_join(waiter, group);
        }
        Ok(())
    }

    fn stamp_join_target(&self, id: TaskId, waiter: &Task, group: GroupId) -> bool {
        let Ok((task, _guard)) = self.lock_task_core(id) else {
            return false;
        };
        if id == waiter.id() || task.is_idle() || task.state() == TaskState::Ending {
            return false;
        }
        if waiter.awaited_join() != group || !task.try_set_join_group(group) {
            return false;
        }
        task.insert_kind(TaskKind::JOIN);
        // A completion that ran past this target before the stamp landed
        // will not come back for it.
        if waiter.awaited_join() != group {
            task.set_join_group(GroupId::INVALID);
            task.remove_kind(TaskKind::JOIN);
            return false;
        }
        true
    }

    fn join_waiter(&self, group: GroupId) -> Option<&Task> {
        if !group.is_valid() {
            return None;
        }
        self.pool.live().find(|task| task.awaited_join() == group)
    }

    /// Gives back one unit of the countdown. Returns `true` only for the
    /// call that completes the join and wakes the waiter.
    pub fn notify_one_in_join_group(&self, group: GroupId) -> bool {
        match self.join_waiter(group) {
            Some(waiter) if waiter.consume_join_unit() => self.complete_join(waiter, group),
            _ => false,
        }
    }

    /// Wakes the waiter of `group` whatever its countdown, disbanding the
    /// group.
    pub fn notify_all_in_join_group(&self, group: GroupId) -> bool {
        match self.join_waiter(group) {
            Some(waiter) if waiter.drain_join_count() => self.complete_join(waiter, group),
            _ => false,
        }
    }

    fn complete_join(&self, waiter: &Task, group: GroupId) -> bool {
        if !waiter.claim_awaited_join(group) {
            return false;
        }
        self.clear_join_targets(group);
        self.groups.release(group);
        klog_debug!("sched: join {:?} complete, waking {}", group, waiter.id());
        if waiter.state() == TaskState::Waiting {
            self.notify_task(waiter.id());
        }
        true
    }

    /// Removes the stamp of `group` from every target still carrying it.
    pub(crate) fn clear_join_targets(&self, group: GroupId) {
        for target in self.pool.live().filter(|task| task.join_group() == group) {
            if let Ok((task, _guard)) = self.lock_task_core(target.id()) {
                if task.join_group() == group {
                    task.set_join_group(GroupId::INVALID);
                    task.remove_kind(TaskKind::JOIN);
                }
            }
        }
    }
}
