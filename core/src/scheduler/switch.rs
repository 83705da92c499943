//! Voluntary and interrupt-driven context switching.
//!
//! Both paths run the same bookkeeping under the current core's lock:
//! select the next task, make it the running task, account idle time, arm
//! the lazy-FPU trap and route the outgoing task by its state. They differ
//! in how registers move: `schedule` hands both snapshots to the platform's
//! register switch, `schedule_in_interrupt` copies them through the trap
//! frame the interrupt will return into. Both write and read the same
//! complete register frame, so a task saved by one path may be resumed by
//! the other.

use kestrel_abi::{TaskState, TrapFrame};
use kestrel_lib::{IrqGuard, cpu, klog_trace};

use super::kernel::Kernel;
use super::per_core::CoreGuard;
use super::task::Task;

impl Kernel {
    /// Voluntary switch. Returns `false` when the calling task keeps the
    /// core because nothing else is runnable.
    pub fn schedule(&self) -> bool {
        let was_enabled = cpu::disable_interrupts();
        let switched = self.switch_voluntary();
        cpu::restore_interrupts(was_enabled);
        switched
    }

    fn switch_voluntary(&self) -> bool {
        let Ok(core) = self.this_core() else {
            return false;
        };
        let mut guard = core.lock();
        let Some((prev, next)) = self.begin_switch(&mut guard) else {
            return false;
        };

        self.route_outgoing(&mut guard, prev);

        let prev_ctx = prev.context_ptr();
        let next_ctx = next.context_ptr();
        // The lock stays held across the switch and is dropped by whoever
        // resumes on this core, so no other core sees a half-saved context.
        guard.leak();
        // SAFETY: interrupts are disabled and both slots outlive the switch.
        unsafe { cpu::switch_context(prev_ctx, next_ctx) };
        self.finish_switch();
        true
    }

    /// Interrupt-driven switch. `frame` holds the interrupted registers on
    /// entry and the registers to resume on return.
    pub fn schedule_in_interrupt(&self, frame: &mut TrapFrame) -> bool {
        let _irq = IrqGuard::new();
        let Ok(core) = self.this_core() else {
            return false;
        };
        let mut guard = core.lock();
        let Some((prev, next)) = self.begin_switch(&mut guard) else {
            return false;
        };

        // SAFETY: both tasks are covered by this core's lock.
        unsafe {
            prev.set_context(*frame);
            *frame = next.context();
        }

        if guard.idle == prev.id() {
            guard.park_idle(prev);
            return true;
        }
        match prev.state() {
            TaskState::Ready => self.submit(prev, guard),
            _ => self.add_task_to_ready_list(&mut guard, prev),
        }
        true
    }

    /// Picks the successor of the running task and installs it. Returns the
    /// outgoing and incoming tasks, or `None` if no switch happens.
    fn begin_switch<'k>(&'k self, guard: &mut CoreGuard<'_>) -> Option<(&'k Task, &'k Task)> {
        let prev = self.pool.get(guard.running)?;
        let next = match guard.next_task_to_run(&self.pool) {
            Some(offset) => self.pool.slot(offset)?,
            None => {
                // A task that cannot continue hands the core to idle.
                let blocked = matches!(prev.state(), TaskState::Waiting | TaskState::Ending);
                if !blocked || guard.idle == prev.id() {
                    return None;
                }
                self.pool.get(guard.idle)?
            }
        };

        let now = cpu::ticks();
        if prev.id() == guard.idle {
            guard.leave_idle(now);
        }
        if next.id() == guard.idle {
            guard.enter_idle(now);
        }

        guard.set_running(next);
        cpu::set_fpu_trap(next.id() != guard.fpu_owner);
        guard.time_budget = self.config.time_slice;
        guard.count_switch();

        klog_trace!(
            "sched: core {} switch {} -> {}",
            guard.index(),
            prev.id(),
            next.id()
        );
        Some((prev, next))
    }

    /// Queues a switched-out task on the current core according to its state.
    /// A ready task pinned to another core is queued here for now and moved
    /// by [`Kernel::finish_switch`], once its registers are saved.
    fn route_outgoing(&self, guard: &mut CoreGuard<'_>, prev: &Task) {
        if guard.idle == prev.id() {
            guard.park_idle(prev);
            return;
        }
        self.add_task_to_ready_list(guard, prev);
        if prev.state() == TaskState::Ready && self.pinned_elsewhere(prev, guard.index()) {
            guard.rehome = prev.id();
        }
    }

    /// Waiting ⇒ common wait list, Ending ⇒ the core's end list, otherwise
    /// the ready list of the task's priority.
    pub(crate) fn add_task_to_ready_list(&self, guard: &mut CoreGuard<'_>, task: &Task) {
        match task.state() {
            TaskState::Waiting => {
                task.set_core(guard.index());
                self.common.push(&self.pool, task);
            }
            TaskState::Ending => {
                guard.push_end(&self.pool, task);
            }
            TaskState::Ready => {
                guard.push_ready(&self.pool, task);
            }
        }
    }
}
