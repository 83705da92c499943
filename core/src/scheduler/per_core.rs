//! Per-core scheduler state.
//!
//! Each core owns five priority ready lists, an end list of tasks awaiting
//! reclamation and the bookkeeping the switch path needs. Everything in
//! [`CoreState`] is guarded by the core's recursive [`Spinlock`]; the only
//! way in is [`CoreScheduler::lock`], which returns a [`CoreGuard`].
//!
//! # Safety Model
//!
//! The spinlock is recursive per core, so a second `lock()` on the same core
//! would hand out a second `&mut CoreState`. Callers never nest guards of one
//! core and never hold guards of two cores at once; cross-core decisions read
//! the lock-free mirrors (`ready_lens`, `running`, `load`) instead.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use kestrel_abi::{NUM_PRIORITIES, Priority, TaskId};
use kestrel_lib::{IndexList, Spinlock, SpinlockGuard};

use super::task::{Residence, Task};
use super::task_pool::TaskPool;
use crate::config::SchedConfig;

/// Slot in a core's tag space after the five priorities.
const END_LIST_SLOT: u32 = NUM_PRIORITIES as u32;

#[inline]
pub(crate) const fn ready_tag(core: usize, priority: usize) -> u32 {
    ((core as u32) << 4) | priority as u32
}

#[inline]
pub(crate) const fn end_tag(core: usize) -> u32 {
    ((core as u32) << 4) | END_LIST_SLOT
}

pub struct CoreState {
    pub running: TaskId,
    pub idle: TaskId,
    ready: [IndexList; NUM_PRIORITIES],
    /// Tasks served from each priority in the current quota round.
    executed: [u32; NUM_PRIORITIES],
    end: IndexList,
    /// Remaining timer ticks before preemption.
    pub time_budget: u32,
    idle_ticks: u64,
    idle_since: Option<u64>,
    sample_tick: u64,
    sample_idle: u64,
    /// Last task whose registers are live in this core's FPU.
    pub fpu_owner: TaskId,
    /// Switched-out task pinned to another core, moved there once the
    /// switch has completed.
    pub rehome: TaskId,
}

impl CoreState {
    fn new(core: usize, time_slice: u32) -> Self {
        Self {
            running: TaskId::INVALID,
            idle: TaskId::INVALID,
            ready: core::array::from_fn(|p| IndexList::new(ready_tag(core, p))),
            executed: [0; NUM_PRIORITIES],
            end: IndexList::new(end_tag(core)),
            time_budget: time_slice,
            idle_ticks: 0,
            idle_since: None,
            sample_tick: 0,
            sample_idle: 0,
            fpu_owner: TaskId::INVALID,
            rehome: TaskId::INVALID,
        }
    }
}

#[repr(align(64))]
pub struct CoreScheduler {
    index: usize,
    lock: Spinlock,
    state: UnsafeCell<CoreState>,
    ready_lens: [AtomicU32; NUM_PRIORITIES],
    running: AtomicU64,
    load: AtomicU32,
    switches: AtomicU64,
    balancing: AtomicBool,
}

// SAFETY: `state` is only reachable through a `CoreGuard`, which holds `lock`.
unsafe impl Sync for CoreScheduler {}
unsafe impl Send for CoreScheduler {}

impl CoreScheduler {
    pub fn new(index: usize, config: &SchedConfig) -> Self {
        Self {
            index,
            lock: Spinlock::new(),
            state: UnsafeCell::new(CoreState::new(index, config.time_slice)),
            ready_lens: [const { AtomicU32::new(0) }; NUM_PRIORITIES],
            running: AtomicU64::new(TaskId::INVALID.to_raw()),
            load: AtomicU32::new(0),
            switches: AtomicU64::new(0),
            balancing: AtomicBool::new(config.load_balancing),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn lock(&self) -> CoreGuard<'_> {
        let lock = self.lock.lock();
        // SAFETY: the spinlock is held and callers never nest guards of
        // one core (see module docs).
        let state = unsafe { &mut *self.state.get() };
        CoreGuard {
            core: self,
            state,
            _lock: lock,
        }
    }

    /// Drops one level of the lock without a guard, for a guard that was
    /// leaked across a register switch.
    #[inline]
    pub(crate) fn release_raw(&self) {
        self.lock.release();
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Ready-list length; lock-free and possibly stale.
    #[inline]
    pub fn ready_len(&self, priority: Priority) -> usize {
        self.ready_lens[priority.index()].load(Ordering::Relaxed) as usize
    }

    pub fn ready_total(&self) -> usize {
        self.ready_lens
            .iter()
            .map(|len| len.load(Ordering::Relaxed) as usize)
            .sum()
    }

    #[inline]
    pub fn running(&self) -> TaskId {
        TaskId::from_raw(self.running.load(Ordering::Acquire))
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn context_switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn balancing(&self) -> bool {
        self.balancing.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_balancing(&self, enabled: bool) {
        self.balancing.store(enabled, Ordering::Relaxed);
    }
}

// =============================================================================
// CoreGuard
// =============================================================================

pub struct CoreGuard<'a> {
    core: &'a CoreScheduler,
    state: &'a mut CoreState,
    _lock: SpinlockGuard<'a>,
}

impl Deref for CoreGuard<'_> {
    type Target = CoreState;

    fn deref(&self) -> &CoreState {
        &*self.state
    }
}

impl DerefMut for CoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut CoreState {
        &mut *self.state
    }
}

impl<'a> CoreGuard<'a> {
    #[inline]
    pub fn index(&self) -> usize {
        self.core.index
    }

    #[inline]
    pub fn scheduler(&self) -> &'a CoreScheduler {
        self.core
    }

    /// Keeps the lock held past this guard. Whoever resumes on this core
    /// releases it with [`CoreScheduler::release_raw`].
    pub fn leak(self) {
        core::mem::forget(self);
    }

    pub fn set_running(&mut self, task: &Task) {
        self.state.running = task.id();
        task.set_core(self.core.index);
        task.set_residence(Residence::Running(self.core.index));
        self.core
            .running
            .store(task.id().to_raw(), Ordering::Release);
    }

    /// Parks the idle task: not listed, runnable whenever nothing else is.
    pub fn park_idle(&mut self, task: &Task) {
        task.set_residence(Residence::Ready(self.core.index));
    }

    pub fn count_switch(&self) {
        self.core.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_len(&self, priority: usize) {
        let len = self.state.ready[priority].len() as u32;
        self.core.ready_lens[priority].store(len, Ordering::Relaxed);
    }

    // --- ready lists ---

    pub fn ready_len(&self, priority: Priority) -> usize {
        self.state.ready[priority.index()].len()
    }

    pub fn push_ready(&mut self, pool: &TaskPool, task: &Task) -> bool {
        let priority = task.priority().index();
        if !self.state.ready[priority].push_back(pool, task.offset()) {
            return false;
        }
        task.set_core(self.core.index);
        task.set_residence(Residence::Ready(self.core.index));
        self.sync_len(priority);
        true
    }

    /// Removes `task` from whichever ready list of this core holds it.
    pub fn remove_ready(&mut self, pool: &TaskPool, task: &Task) -> bool {
        let Some(tag) = task.sched_link.owner() else {
            return false;
        };
        let Some(priority) = (0..NUM_PRIORITIES).find(|&p| ready_tag(self.core.index, p) == tag)
        else {
            return false;
        };
        if !self.state.ready[priority].remove(pool, task.offset()) {
            return false;
        }
        task.set_residence(Residence::Detached);
        self.sync_len(priority);
        true
    }

    pub fn is_ready_here(&self, pool: &TaskPool, task: &Task) -> bool {
        self.state
            .ready
            .iter()
            .any(|list| list.contains(pool, task.offset()))
    }

    /// Quota-based selection.
    ///
    /// Runs at most two passes over the priorities. The first priority that
    /// has served fewer tasks this round than it holds yields its head; an
    /// exhausted priority starts a new round and the scan moves on. Higher
    /// priorities are preferred but cannot starve lower ones indefinitely.
    pub fn next_task_to_run(&mut self, pool: &TaskPool) -> Option<u32> {
        for _pass in 0..2 {
            for priority in 0..NUM_PRIORITIES {
                let len = self.state.ready[priority].len() as u32;
                if self.state.executed[priority] < len {
                    let offset = self.state.ready[priority].pop_front(pool)?;
                    self.state.executed[priority] += 1;
                    self.sync_len(priority);
                    if let Some(task) = pool.slot(offset) {
                        task.set_residence(Residence::Detached);
                    }
                    return Some(offset);
                }
                self.state.executed[priority] = 0;
            }
        }
        None
    }

    // --- end list ---

    pub fn push_end(&mut self, pool: &TaskPool, task: &Task) -> bool {
        if !self.state.end.push_back(pool, task.offset()) {
            return false;
        }
        task.set_core(self.core.index);
        task.set_residence(Residence::Ending(self.core.index));
        true
    }

    pub fn pop_end(&mut self, pool: &TaskPool) -> Option<u32> {
        let offset = self.state.end.pop_front(pool)?;
        if let Some(task) = pool.slot(offset) {
            task.set_residence(Residence::Detached);
        }
        Some(offset)
    }

    pub fn end_len(&self) -> usize {
        self.state.end.len()
    }

    // --- idle accounting ---

    pub fn enter_idle(&mut self, now: u64) {
        self.state.idle_since = Some(now);
    }

    pub fn leave_idle(&mut self, now: u64) {
        if let Some(since) = self.state.idle_since.take() {
            self.state.idle_ticks += now.saturating_sub(since);
        }
    }

    /// Recomputes the load over the ticks elapsed since the last sample,
    /// counting an idle span still in progress.
    pub fn sample_load(&mut self, now: u64) -> u32 {
        if let Some(since) = self.state.idle_since {
            self.state.idle_ticks += now.saturating_sub(since);
            self.state.idle_since = Some(now);
        }

        let elapsed = now.saturating_sub(self.state.sample_tick);
        if elapsed == 0 {
            return self.core.load();
        }
        let idle = self
            .state
            .idle_ticks
            .saturating_sub(self.state.sample_idle)
            .min(elapsed);
        let load = (100 - idle * 100 / elapsed) as u32;

        self.state.sample_tick = now;
        self.state.sample_idle = self.state.idle_ticks;
        self.core.load.store(load, Ordering::Relaxed);
        load
    }
}
