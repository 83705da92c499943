//! The kernel scheduling state.
//!
//! One [`Kernel`] value owns the task pool, the per-core schedulers, the
//! common wait list and the group-id allocator. The running kernel keeps a
//! single instance in [`KERNEL`]; tests build as many private instances as
//! they need.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kestrel_abi::{TaskId, TrapFrame};
use kestrel_lib::{
    KernelAllocator, TaskRuntime, cpu, klog_debug, klog_info, klog_init, klog_warn,
};
use spin::Once;

use super::common::CommonScheduler;
use super::group_id::GroupIdAllocator;
use super::per_core::CoreScheduler;
use super::task::Task;
use super::task_pool::TaskPool;
use crate::config::SchedConfig;
use crate::error::{SchedError, SchedResult};

/// Called for every reclaimed task, e.g. to drop its GUI resources.
pub type ReleaseHook = fn(TaskId);

pub struct Kernel {
    pub(crate) config: SchedConfig,
    pub(crate) pool: TaskPool,
    pub(crate) cores: Box<[CoreScheduler]>,
    pub(crate) common: CommonScheduler,
    pub(crate) groups: GroupIdAllocator,
    pub(crate) allocator: &'static dyn KernelAllocator,
    release_hook: Once<ReleaseHook>,
}

impl Kernel {
    pub fn new(config: SchedConfig, allocator: &'static dyn KernelAllocator) -> Self {
        let config = config.normalized();
        let cores: Vec<CoreScheduler> = (0..config.core_count)
            .map(|index| CoreScheduler::new(index, &config))
            .collect();
        Self {
            pool: TaskPool::new(config.task_capacity),
            cores: cores.into_boxed_slice(),
            common: CommonScheduler::new(),
            groups: GroupIdAllocator::new(),
            allocator,
            release_hook: Once::new(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    #[inline]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub(crate) fn core(&self, index: usize) -> SchedResult<&CoreScheduler> {
        self.cores
            .get(index)
            .ok_or(SchedError::InvalidCore { core: index })
    }

    pub(crate) fn this_core(&self) -> SchedResult<&CoreScheduler> {
        self.core(cpu::current_core())
    }

    pub(crate) fn task(&self, id: TaskId) -> SchedResult<&Task> {
        self.pool.get(id).ok_or(SchedError::StaleTask { id })
    }

    /// Installs the reclamation hook. Only the first registration sticks.
    pub fn register_release_hook(&self, hook: ReleaseHook) -> bool {
        let installed = self.release_hook.call_once(|| hook);
        core::ptr::fn_addr_eq(*installed, hook)
    }

    pub(crate) fn run_release_hook(&self, id: TaskId) {
        if let Some(hook) = self.release_hook.get() {
            hook(id);
        }
    }

    /// Collapses an internal result into the boolean the public surface
    /// reports, logging the cause of a failure.
    pub(crate) fn settle(&self, op: &str, result: SchedResult) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                log_failure(op, err);
                false
            }
        }
    }

    /// Like [`Kernel::settle`] for operations yielding a task id.
    pub(crate) fn settle_id(&self, op: &str, result: SchedResult<TaskId>) -> TaskId {
        result.unwrap_or_else(|err| {
            log_failure(op, err);
            TaskId::INVALID
        })
    }

    /// Completes a register switch on the resumed side: drops the scheduler
    /// lock the switching task leaked across the switch and moves a
    /// switched-out task that is pinned elsewhere. Safe to repeat; a lock
    /// this core no longer holds is left alone.
    pub fn finish_switch(&self) {
        let Ok(scheduler) = self.this_core() else {
            return;
        };
        scheduler.release_raw();
        let pending = core::mem::replace(&mut scheduler.lock().rehome, TaskId::INVALID);
        if pending.is_valid() {
            self.move_to_pinned_core(pending);
        }
    }

    /// Timer interrupt entry: charges one tick against the running task's
    /// budget and preempts it once the budget is spent.
    pub fn timer_tick(&self, frame: &mut TrapFrame) -> bool {
        let Ok(core) = self.this_core() else {
            return false;
        };
        let expired = {
            let mut guard = core.lock();
            guard.time_budget = guard.time_budget.saturating_sub(1);
            guard.time_budget == 0
        };
        if !expired {
            return false;
        }
        if self.schedule_in_interrupt(frame) {
            return true;
        }
        core.lock().time_budget = self.config.time_slice;
        false
    }
}

fn log_failure(op: &str, err: SchedError) {
    match err {
        SchedError::PoolExhausted
        | SchedError::StackAllocationFailed { .. }
        | SchedError::GroupsExhausted
        | SchedError::ParentGone { .. } => klog_warn!("sched: {} failed: {}", op, err),
        _ => klog_debug!("sched: {} failed: {}", op, err),
    }
}

impl TaskRuntime for Kernel {
    fn current_task_id(&self) -> TaskId {
        Kernel::current_task_id(self)
    }

    fn yield_now(&self) -> bool {
        self.schedule()
    }
}

// =============================================================================
// Global instance
// =============================================================================

static KERNEL: Once<Kernel> = Once::new();

/// Builds the global kernel instance. Later calls return the first one.
pub fn init(config: SchedConfig, allocator: &'static dyn KernelAllocator) -> &'static Kernel {
    let kernel = KERNEL.call_once(|| {
        let kernel = Kernel::new(config, allocator);
        klog_init(kernel.config.log_level);
        klog_info!(
            "sched: {} cores, {} task slots, {} tick slice",
            kernel.config.core_count,
            kernel.config.task_capacity,
            kernel.config.time_slice
        );
        kernel
    });
    cpu::register_resume_hook(resume_hook);
    kernel
}

#[inline]
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

/// Runs on the incoming task's stack during a platform register switch.
fn resume_hook() {
    if let Some(kernel) = kernel() {
        kernel.finish_switch();
    }
}

/// Exit routine every task entry returns into.
pub extern "C" fn exit_current_task() -> ! {
    match kernel() {
        Some(kernel) => kernel.exit_task(),
        None => loop {
            cpu::halt();
        },
    }
}
