//! The task entity.
//!
//! Scalar fields are atomics so any core can read them without locking;
//! writers hold the validated lock of the task's core (see
//! [`Kernel::lock_task_core`](super::Kernel)) or are the task itself while
//! running. The register snapshot and FPU area are plain cells accessed only
//! under the lock of the core whose ready/running state covers the task.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use kestrel_abi::{
    Affinity, FpuState, GroupId, MemRegion, Priority, TaskContext, TaskFlags, TaskId, TaskKind,
    TaskState,
};
use kestrel_lib::{IndexList, IrqMutex, Link};

/// Tag bit of a per-process child list; the low bits carry the slot offset.
const CHILD_LIST_TAG: u32 = 0x8000_0000;
const NO_CORE: u32 = u32::MAX;
/// Extra unit of a join countdown held by the waiter while it stamps its
/// targets; the join cannot complete before it is released.
const JOIN_GUARD: u32 = 0x8000_0000;

// =============================================================================
// Residence
// =============================================================================

/// Where a task currently sits. Exactly one variant holds at any instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residence {
    /// In no list and not running: freshly allocated, or in transit between
    /// two cores during a migration.
    Detached,
    Running(usize),
    /// In a ready list of the core (or parked as that core's idle task).
    Ready(usize),
    /// In the common wait list.
    Waiting,
    /// In the core's end list, awaiting reclamation.
    Ending(usize),
}

const RES_KIND_SHIFT: u32 = 24;
const RES_CORE_MASK: u32 = 0x00FF_FFFF;
const RES_DETACHED: u32 = 0;
const RES_RUNNING: u32 = 1;
const RES_READY: u32 = 2;
const RES_WAITING: u32 = 3;
const RES_ENDING: u32 = 4;

impl Residence {
    const fn to_raw(self) -> u32 {
        match self {
            Residence::Detached => RES_DETACHED << RES_KIND_SHIFT,
            Residence::Running(core) => (RES_RUNNING << RES_KIND_SHIFT) | core as u32,
            Residence::Ready(core) => (RES_READY << RES_KIND_SHIFT) | core as u32,
            Residence::Waiting => RES_WAITING << RES_KIND_SHIFT,
            Residence::Ending(core) => (RES_ENDING << RES_KIND_SHIFT) | core as u32,
        }
    }

    const fn from_raw(raw: u32) -> Self {
        let core = (raw & RES_CORE_MASK) as usize;
        match raw >> RES_KIND_SHIFT {
            RES_RUNNING => Residence::Running(core),
            RES_READY => Residence::Ready(core),
            RES_WAITING => Residence::Waiting,
            RES_ENDING => Residence::Ending(core),
            _ => Residence::Detached,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Ownership data that changes together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskResources {
    /// Memory region of the process; a thread shares its parent's.
    pub memory: MemRegion,
    pub stack: MemRegion,
    /// Owning process of a thread, `INVALID` otherwise.
    pub parent: TaskId,
}

pub struct Task {
    id: AtomicU64,
    flags: AtomicU32,
    core: AtomicU32,
    affinity: AtomicU32,
    residence: AtomicU32,
    wait_group: AtomicU64,
    /// Join group this task is a target of.
    join_group: AtomicU64,
    /// Join group this task waits on.
    awaited_join: AtomicU64,
    join_count: AtomicU32,
    fpu_used: AtomicBool,
    resources: IrqMutex<TaskResources>,
    /// Ready, end or wait list membership.
    pub(crate) sched_link: Link,
    /// Membership in the parent's child list.
    pub(crate) child_link: Link,
    pub(crate) children: IrqMutex<IndexList>,
    context: UnsafeCell<TaskContext>,
    fpu: UnsafeCell<FpuState>,
}

// SAFETY: all shared mutation goes through atomics and locks; the two
// `UnsafeCell`s are only touched under the owning core's scheduler lock.
unsafe impl Sync for Task {}
unsafe impl Send for Task {}

impl Task {
    pub(crate) const fn new(offset: u32) -> Self {
        Self {
            id: AtomicU64::new(TaskId::INVALID.to_raw()),
            flags: AtomicU32::new(0),
            core: AtomicU32::new(NO_CORE),
            affinity: AtomicU32::new(Affinity::Any.to_raw()),
            residence: AtomicU32::new(Residence::Detached.to_raw()),
            wait_group: AtomicU64::new(GroupId::INVALID.to_raw()),
            join_group: AtomicU64::new(GroupId::INVALID.to_raw()),
            awaited_join: AtomicU64::new(GroupId::INVALID.to_raw()),
            join_count: AtomicU32::new(0),
            fpu_used: AtomicBool::new(false),
            resources: IrqMutex::new(TaskResources {
                memory: MemRegion::EMPTY,
                stack: MemRegion::EMPTY,
                parent: TaskId::INVALID,
            }),
            sched_link: Link::new(),
            child_link: Link::new(),
            children: IrqMutex::new(IndexList::new(CHILD_LIST_TAG | offset)),
            context: UnsafeCell::new(TaskContext::zero()),
            fpu: UnsafeCell::new(FpuState::new()),
        }
    }

    /// Stamps a freshly allocated slot and resets every per-task field.
    pub(crate) fn reset(&self, id: TaskId) {
        self.flags.store(0, Ordering::Relaxed);
        self.core.store(NO_CORE, Ordering::Relaxed);
        self.affinity.store(Affinity::Any.to_raw(), Ordering::Relaxed);
        self.residence
            .store(Residence::Detached.to_raw(), Ordering::Relaxed);
        self.wait_group
            .store(GroupId::INVALID.to_raw(), Ordering::Relaxed);
        self.join_group
            .store(GroupId::INVALID.to_raw(), Ordering::Relaxed);
        self.awaited_join
            .store(GroupId::INVALID.to_raw(), Ordering::Relaxed);
        self.join_count.store(0, Ordering::Relaxed);
        self.fpu_used.store(false, Ordering::Relaxed);
        *self.resources.lock() = TaskResources::default();
        self.id.store(id.to_raw(), Ordering::Release);
    }

    /// Invalidates the slot. Stale ids stop resolving from here on.
    pub(crate) fn clear(&self) {
        self.id
            .store(TaskId::INVALID.to_raw(), Ordering::Release);
        self.residence
            .store(Residence::Detached.to_raw(), Ordering::Relaxed);
        // SAFETY: the slot is no longer reachable through any list or id.
        unsafe { *self.context.get() = TaskContext::zero() };
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        TaskId::from_raw(self.id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.id().offset()
    }

    // --- flags ---

    #[inline]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_flags(&self, flags: TaskFlags) {
        self.flags.store(flags.to_bits(), Ordering::Release);
    }

    fn update_flags(&self, f: impl Fn(&mut TaskFlags)) -> TaskFlags {
        let mut updated = self.flags();
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let mut flags = TaskFlags::from_bits(bits);
                f(&mut flags);
                updated = flags;
                Some(flags.to_bits())
            });
        updated
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.flags().state
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.update_flags(|flags| flags.state = state);
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.flags().priority
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.update_flags(|flags| flags.priority = priority);
    }

    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.flags().kind
    }

    pub(crate) fn insert_kind(&self, kind: TaskKind) {
        self.update_flags(|flags| flags.kind.insert(kind));
    }

    pub(crate) fn remove_kind(&self, kind: TaskKind) {
        self.update_flags(|flags| flags.kind.remove(kind));
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.flags().is_idle()
    }

    // --- placement ---

    /// Core whose lock covers the task.
    #[inline]
    pub fn core(&self) -> usize {
        self.core.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn set_core(&self, core: usize) {
        self.core.store(core as u32, Ordering::Release);
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        Affinity::from_raw(self.affinity.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_affinity(&self, affinity: Affinity) {
        self.affinity.store(affinity.to_raw(), Ordering::Relaxed);
    }

    #[inline]
    pub fn residence(&self) -> Residence {
        Residence::from_raw(self.residence.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_residence(&self, residence: Residence) {
        self.residence.store(residence.to_raw(), Ordering::Release);
    }

    // --- groups ---

    #[inline]
    pub fn wait_group(&self) -> GroupId {
        GroupId::from_raw(self.wait_group.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_wait_group(&self, group: GroupId) {
        self.wait_group.store(group.to_raw(), Ordering::Release);
    }

    /// Clears the wait group if it still equals `group`. Exactly one caller
    /// wins, which makes it the one entitled to wake the task.
    pub(crate) fn claim_wait_group(&self, group: GroupId) -> bool {
        self.wait_group
            .compare_exchange(
                group.to_raw(),
                GroupId::INVALID.to_raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    pub fn join_group(&self) -> GroupId {
        GroupId::from_raw(self.join_group.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_join_group(&self, group: GroupId) {
        self.join_group.store(group.to_raw(), Ordering::SeqCst);
    }

    /// Stamps the join group only if the task is no target yet.
    pub(crate) fn try_set_join_group(&self, group: GroupId) -> bool {
        self.join_group
            .compare_exchange(
                GroupId::INVALID.to_raw(),
                group.to_raw(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    pub fn awaited_join(&self) -> GroupId {
        GroupId::from_raw(self.awaited_join.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_awaited_join(&self, group: GroupId) {
        self.awaited_join.store(group.to_raw(), Ordering::SeqCst);
    }

    /// Clears the awaited join group if it still equals `group`. Exactly
    /// one caller wins and becomes responsible for releasing the group.
    pub(crate) fn claim_awaited_join(&self, group: GroupId) -> bool {
        self.awaited_join
            .compare_exchange(
                group.to_raw(),
                GroupId::INVALID.to_raw(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Outstanding target units, not counting the stamping guard.
    #[inline]
    pub fn join_count(&self) -> u32 {
        self.join_count.load(Ordering::Acquire) & !JOIN_GUARD
    }

    /// Starts a countdown of `count` units plus the stamping guard.
    #[inline]
    pub(crate) fn arm_join(&self, count: u32) {
        self.join_count
            .store((count & !JOIN_GUARD) | JOIN_GUARD, Ordering::Release);
    }

    /// Consumes one target unit and reports whether that completed the
    /// countdown. Never consumes the guard; a countdown with no target
    /// units left is untouched.
    pub(crate) fn consume_join_unit(&self) -> bool {
        self.join_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count & !JOIN_GUARD != 0).then(|| count - 1)
            })
            .is_ok_and(|previous| previous == 1)
    }

    /// Drops the stamping guard; `true` if no target units were left.
    pub(crate) fn release_join_guard(&self) -> bool {
        self.join_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count & JOIN_GUARD != 0).then(|| count & !JOIN_GUARD)
            })
            .is_ok_and(|previous| previous == JOIN_GUARD)
    }

    /// Drops the whole countdown; `true` if any units were outstanding.
    pub(crate) fn drain_join_count(&self) -> bool {
        self.join_count.swap(0, Ordering::AcqRel) != 0
    }

    // --- resources ---

    pub fn resources(&self) -> TaskResources {
        *self.resources.lock()
    }

    pub(crate) fn set_resources(&self, resources: TaskResources) {
        *self.resources.lock() = resources;
    }

    // --- register state ---

    #[inline]
    pub fn fpu_used(&self) -> bool {
        self.fpu_used.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_fpu_used(&self, used: bool) {
        self.fpu_used.store(used, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut TaskContext {
        self.context.get()
    }

    /// # Safety
    /// The caller holds the scheduler lock of the task's core.
    #[inline]
    pub(crate) unsafe fn context(&self) -> TaskContext {
        unsafe { *self.context.get() }
    }

    /// # Safety
    /// The caller holds the scheduler lock of the task's core.
    #[inline]
    pub(crate) unsafe fn set_context(&self, ctx: TaskContext) {
        unsafe { *self.context.get() = ctx };
    }

    /// # Safety
    /// The caller holds the scheduler lock of the core whose FPU last held
    /// this task's registers.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn fpu_area(&self) -> &mut FpuState {
        unsafe { &mut *self.fpu.get() }
    }
}
