//! Scheduler scenario tests.
//!
//! Run on the host CPU model: each test thread plays core 0 unless it says
//! otherwise, and a `schedule()` returns immediately with the calling
//! thread acting as whichever task was switched in.

extern crate std;

use alloc::boxed::Box;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::vec::Vec;

use kestrel_abi::{
    Affinity, GroupId, KERNEL_CS, KERNEL_SS, MemRegion, Priority, RFLAGS_DEFAULT, TaskContext,
    TaskId, TaskKind, TaskState,
};
use kestrel_lib::host::{self, HostAllocator};
use kestrel_lib::{AnyLock, KernelAllocator, Mutex, Spinlock, cpu};

use super::kernel::{Kernel, exit_current_task};
use super::per_core::CoreScheduler;
use super::task::Residence;
use crate::config::SchedConfig;

// =============================================================================
// RAII fixture
// =============================================================================

/// A private kernel with every core brought up, driven from core 0.
struct SchedFixture {
    kernel: Kernel,
    allocator: &'static HostAllocator,
}

impl SchedFixture {
    fn new(cores: usize) -> Self {
        Self::with_config(SchedConfig::new().with_cores(cores))
    }

    fn with_config(config: SchedConfig) -> Self {
        host::install();
        host::set_current_core(0);
        host::set_ticks(0);
        cpu::restore_interrupts(true);

        let allocator: &'static HostAllocator = Box::leak(Box::new(HostAllocator::new()));
        let kernel = Kernel::new(config, allocator);
        for core in 0..kernel.core_count() {
            assert!(kernel.start_core(core).is_valid());
        }
        Self { kernel, allocator }
    }

    fn scheduler(&self, core: usize) -> &CoreScheduler {
        self.kernel.core(core).unwrap()
    }

    fn try_spawn(&self, priority: Priority, affinity: Affinity) -> TaskId {
        self.kernel.create_task(
            TaskKind::SYSTEM,
            priority,
            MemRegion::EMPTY,
            0x4000_1000,
            affinity,
        )
    }

    fn spawn(&self, priority: Priority, affinity: Affinity) -> TaskId {
        let id = self.try_spawn(priority, affinity);
        assert!(id.is_valid());
        id
    }

    fn idle_of(&self, core: usize) -> TaskId {
        self.scheduler(core).lock().idle
    }

    fn any_live_task(&self) -> TaskId {
        self.pool
            .live()
            .find(|task| !task.is_idle())
            .map(|task| task.id())
            .unwrap()
    }
}

impl Deref for SchedFixture {
    type Target = Kernel;

    fn deref(&self) -> &Kernel {
        &self.kernel
    }
}

impl Drop for SchedFixture {
    fn drop(&mut self) {
        host::set_current_core(0);
        cpu::restore_interrupts(true);
    }
}

// =============================================================================
// Identity and residence
// =============================================================================

#[test]
fn ids_stay_unique_and_stale_ids_are_rejected() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::Normal, Affinity::Any);
    let b = k.spawn(Priority::Normal, Affinity::Any);
    assert_ne!(a, b);

    assert!(k.end_task(a));
    assert_eq!(k.reclaim_ending(k.scheduler(0)), 1);
    assert!(!k.exist_task(a));

    let c = k.spawn(Priority::Normal, Affinity::Any);
    assert_eq!(c.offset(), a.offset());
    assert_ne!(c, a);

    assert!(!k.end_task(a));
    assert!(!k.wait_task(a));
    assert!(!k.notify_task(a));
    assert!(!k.change_task_priority(a, Priority::High));
    assert!(!k.remove_task_from_ready_list(0, a));
    assert!(k.exist_task(c));

    let out_of_range = TaskId::new(a.generation(), 1000);
    assert!(!k.exist_task(out_of_range));
    assert!(!k.end_task(out_of_range));
}

#[test]
fn residence_follows_each_transition() {
    let k = SchedFixture::new(1);
    let idle = k.idle_of(0);
    assert_eq!(k.task_residence(idle), Some(Residence::Running(0)));

    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));

    assert!(k.schedule());
    assert_eq!(k.current_task_id(), a);
    assert_eq!(k.task_residence(a), Some(Residence::Running(0)));
    assert_eq!(k.task_residence(idle), Some(Residence::Ready(0)));

    // Waiting on itself with nothing else ready hands the core to idle.
    assert!(k.wait_task(a));
    assert_eq!(k.current_task_id(), idle);
    assert_eq!(k.task_residence(a), Some(Residence::Waiting));
    assert!(k.common.contains(&k.pool, k.task(a).unwrap()));

    assert!(k.notify_task(a));
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
    assert!(!k.common.contains(&k.pool, k.task(a).unwrap()));
    assert!(!k.notify_task(a));

    assert!(k.end_task(a));
    assert_eq!(k.task_residence(a), Some(Residence::Ending(0)));
    assert_eq!(k.task_state(a), Some(TaskState::Ending));
    assert_eq!(k.scheduler(0).ready_total(), 0);
    assert!(!k.wait_task(a));
}

#[test]
fn idle_task_cannot_be_ended_waited_or_moved() {
    let k = SchedFixture::new(2);
    let idle = k.idle_of(1);
    assert!(!k.end_task(idle));
    assert!(!k.wait_task(idle));
    assert!(!k.change_task_priority(idle, Priority::Highest));
    assert!(!k.change_task_affinity(idle, Affinity::Core(0)));
    assert_eq!(k.task_count(), 2);
    assert!(!k.start_core(1).is_valid());
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn new_task_context_enters_through_the_trampoline() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::High, Affinity::Any);
    let task = k.task(a).unwrap();
    let stack = task.resources().stack;
    assert!(k.allocator.is_live(stack));

    let ctx: TaskContext = unsafe { task.context() };
    assert_eq!(ctx.rip, host::HOST_TRAMPOLINE);
    assert_eq!(ctx.entry(), 0x4000_1000);
    assert_eq!(ctx.argument(), 0);
    assert_eq!(ctx.return_address(), exit_current_task as usize as u64);
    assert_eq!(ctx.rsp, (stack.end() as u64) & !0xF);
}

#[test]
fn exhaustion_returns_invalid_without_leaking() {
    let k = SchedFixture::with_config(SchedConfig {
        task_capacity: 4,
        ..SchedConfig::new()
    });
    for _ in 0..3 {
        k.spawn(Priority::Normal, Affinity::Any);
    }
    let stacks = k.allocator.live_count();
    let none = k.try_spawn(Priority::Normal, Affinity::Any);
    assert!(!none.is_valid());
    assert_eq!(k.allocator.live_count(), stacks);

    let victim = k.any_live_task();
    assert!(k.end_task(victim));
    k.reclaim_ending(k.scheduler(0));

    k.allocator.set_exhausted(true);
    let none = k.try_spawn(Priority::Normal, Affinity::Any);
    assert!(!none.is_valid());
    assert_eq!(k.task_count(), 3);
    k.allocator.set_exhausted(false);
    assert!(k.try_spawn(Priority::Normal, Affinity::Any).is_valid());
}

#[test]
fn affinity_beyond_core_count_is_rejected() {
    let k = SchedFixture::new(2);
    let id = k.try_spawn(Priority::Normal, Affinity::Core(2));
    assert!(!id.is_valid());

    let pinned = k.spawn(Priority::Normal, Affinity::Core(1));
    assert_eq!(k.task_residence(pinned), Some(Residence::Ready(1)));
    assert!(!k.change_task_affinity(pinned, Affinity::Core(9)));
}

#[test]
fn thread_shares_process_memory_and_links_to_it() {
    let k = SchedFixture::new(1);
    let memory = k.allocator.allocate(0x4000).unwrap();
    let p = k.create_task(
        TaskKind::PROCESS | TaskKind::USER,
        Priority::High,
        memory,
        0x5000,
        Affinity::Any,
    );
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), p);

    let t = k.create_thread(0x6000, 7, Affinity::Any, 0);
    assert!(t.is_valid());
    let thread = k.task(t).unwrap();
    assert_eq!(thread.resources().memory, memory);
    assert_eq!(thread.resources().parent, p);
    assert_eq!(thread.priority(), Priority::High);
    assert!(thread.kind().contains(TaskKind::THREAD | TaskKind::USER));
    assert!(!thread.kind().contains(TaskKind::PROCESS));

    let ctx = unsafe { thread.context() };
    assert_eq!(ctx.argument(), 7);
    assert_eq!(ctx.return_address(), exit_current_task as usize as u64);

    let custom = k.create_thread(0x6000, 8, Affinity::Any, 0xDEAD_0000);
    assert_eq!(
        unsafe { k.task(custom).unwrap().context() }.return_address(),
        0xDEAD_0000
    );

    let parent = k.task(p).unwrap();
    let children: Vec<u32> = parent
        .children
        .lock()
        .iter(&k.pool.children_arena())
        .collect();
    assert_eq!(children, [t.offset(), custom.offset()]);
}

#[test]
fn thread_creation_fails_for_ending_or_missing_process() {
    let k = SchedFixture::new(1);
    // The idle task is no process.
    assert!(!k.create_thread(0x6000, 0, Affinity::Any, 0).is_valid());

    let p = k.create_task(
        TaskKind::PROCESS,
        Priority::Normal,
        MemRegion::EMPTY,
        0x5000,
        Affinity::Any,
    );
    assert!(k.schedule());
    k.task(p).unwrap().set_state(TaskState::Ending);

    let used = k.task_count();
    let stacks = k.allocator.live_count();
    assert!(!k.create_thread(0x6000, 0, Affinity::Any, 0).is_valid());
    assert_eq!(k.task_count(), used);
    assert_eq!(k.allocator.live_count(), stacks);
}

// =============================================================================
// Switching
// =============================================================================

#[test]
fn schedule_without_ready_tasks_keeps_the_caller() {
    let k = SchedFixture::new(1);
    let switches = k.context_switches(0);
    assert!(!k.schedule());
    assert_eq!(k.context_switches(0), switches);
    assert!(cpu::are_interrupts_enabled());
}

#[test]
fn voluntary_switch_swaps_live_registers() {
    let k = SchedFixture::new(1);
    let idle = k.idle_of(0);
    let a = k.spawn(Priority::Normal, Affinity::Any);

    let mut boot = TaskContext::zero();
    boot.rip = 0x1234;
    host::set_live_context(boot);
    let before = host::switch_count();

    assert!(k.schedule());
    assert_eq!(host::switch_count(), before + 1);
    assert_eq!(host::live_context().entry(), 0x4000_1000);
    assert_eq!(unsafe { k.task(idle).unwrap().context() }.rip, 0x1234);
    assert!(!k.scheduler(0).is_locked());
    assert_eq!(k.current_task_id(), a);
}

#[test]
fn timer_tick_preempts_after_the_time_slice() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let b = k.create_task(
        TaskKind::SYSTEM,
        Priority::Normal,
        MemRegion::EMPTY,
        0x2222,
        Affinity::Any,
    );

    let mut frame = TaskContext::zero();
    frame.rip = 0xAAAA;
    let slice = k.config().time_slice;
    for _ in 1..slice {
        assert!(!k.timer_tick(&mut frame));
    }
    assert!(k.timer_tick(&mut frame));
    assert_eq!(k.current_task_id(), b);
    assert_eq!(frame.entry(), 0x2222);
    assert_eq!((frame.cs, frame.ss), (KERNEL_CS, KERNEL_SS));
    assert_eq!(unsafe { k.task(a).unwrap().context() }.rip, 0xAAAA);
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
}

#[test]
fn preempted_task_resumes_through_a_voluntary_switch() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let b = k.spawn(Priority::Normal, Affinity::Any);

    let mut frame = TaskContext::zero();
    frame.rip = 0xAAAA;
    frame.rax = 0x1111;
    frame.r11 = 0x2222;
    frame.rflags = RFLAGS_DEFAULT;
    frame.cs = KERNEL_CS;
    frame.ss = KERNEL_SS;
    assert!(k.schedule_in_interrupt(&mut frame));
    assert_eq!(k.current_task_id(), b);
    assert_eq!(frame.entry(), 0x4000_1000);
    assert_eq!((frame.cs, frame.ss), (KERNEL_CS, KERNEL_SS));
    assert!(!k.scheduler(0).is_locked());

    // b yields and a comes back with every register it was interrupted in.
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), a);
    let live = host::live_context();
    assert_eq!((live.rip, live.rax, live.r11), (0xAAAA, 0x1111, 0x2222));
    assert_eq!(live.rflags, RFLAGS_DEFAULT);
    assert!(!k.scheduler(0).is_locked());
}

#[test]
fn timer_tick_with_nothing_ready_restarts_the_slice() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());

    let mut frame = TaskContext::zero();
    let slice = k.config().time_slice;
    for _ in 0..slice {
        assert!(!k.timer_tick(&mut frame));
    }
    assert_eq!(k.scheduler(0).lock().time_budget, slice);
    assert_eq!(k.current_task_id(), a);
}

#[test]
fn priority_change_requeues_ready_task() {
    let k = SchedFixture::new(1);
    let a = k.spawn(Priority::Low, Affinity::Any);
    assert_eq!(k.scheduler(0).ready_len(Priority::Low), 1);

    assert!(k.change_task_priority(a, Priority::Highest));
    assert_eq!(k.scheduler(0).ready_len(Priority::Low), 0);
    assert_eq!(k.scheduler(0).ready_len(Priority::Highest), 1);
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
}

#[test]
fn task_count_excludes_idle() {
    let k = SchedFixture::new(1);
    assert_eq!(k.get_task_count(0), 0);
    k.spawn(Priority::Normal, Affinity::Any);
    k.spawn(Priority::Normal, Affinity::Any);
    assert_eq!(k.get_task_count(0), 2);
    assert!(k.schedule());
    assert_eq!(k.get_task_count(0), 2);
    assert_eq!(k.get_task_count(7), 0);
}

// =============================================================================
// Load balancing
// =============================================================================

#[test]
fn balancing_migrates_only_past_the_threshold() {
    let k = SchedFixture::new(2);
    let t1 = k.spawn(Priority::Normal, Affinity::Any);
    let t2 = k.spawn(Priority::Normal, Affinity::Any);
    // Source holds 2, core 1 holds 0: 0 <= 2 - 2.
    let t3 = k.spawn(Priority::Normal, Affinity::Any);
    // Source holds 2, core 1 holds 1: 1 > 2 - 2.
    let t4 = k.spawn(Priority::Normal, Affinity::Any);

    assert_eq!(k.task_residence(t1), Some(Residence::Ready(0)));
    assert_eq!(k.task_residence(t2), Some(Residence::Ready(0)));
    assert_eq!(k.task_residence(t3), Some(Residence::Ready(1)));
    assert_eq!(k.task_residence(t4), Some(Residence::Ready(0)));
    assert_eq!(k.task(t3).unwrap().core(), 1);

    // Lengths are compared per priority.
    let high = k.spawn(Priority::High, Affinity::Any);
    assert_eq!(k.task_residence(high), Some(Residence::Ready(0)));
}

#[test]
fn disabled_balancing_keeps_tasks_local() {
    let k = SchedFixture::new(2);
    assert!(k.set_load_balancing(0, false));
    for _ in 0..6 {
        k.spawn(Priority::Normal, Affinity::Any);
    }
    assert_eq!(k.scheduler(0).ready_len(Priority::Normal), 6);
    assert_eq!(k.scheduler(1).ready_total(), 0);
    assert!(!k.set_load_balancing(5, true));
}

#[test]
fn affinity_change_moves_ready_task() {
    let k = SchedFixture::new(2);
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.change_task_affinity(a, Affinity::Core(1)));
    assert_eq!(k.task_residence(a), Some(Residence::Ready(1)));
    assert_eq!(k.scheduler(0).ready_total(), 0);
    assert_eq!(k.scheduler(1).ready_len(Priority::Normal), 1);
}

// =============================================================================
// Lazy FPU
// =============================================================================

/// Runs `a` on core 0 with three pinned tasks queued behind it and gives it
/// the FPU.
fn fpu_owner_scenario(k: &SchedFixture) -> TaskId {
    let a = k.spawn(Priority::Normal, Affinity::Any);
    for _ in 0..3 {
        k.spawn(Priority::Normal, Affinity::Core(0));
    }
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), a);
    assert!(host::fpu_trap_armed());

    assert!(k.handle_fpu_fault());
    assert!(!host::fpu_trap_armed());
    assert_eq!(k.scheduler(0).lock().fpu_owner, a);
    host::write_fpu_registers(0xAB);
    a
}

#[test]
fn first_fpu_use_installs_fresh_state() {
    let k = SchedFixture::new(1);
    let restores = host::fpu_restore_count();
    let saves = host::fpu_save_count();
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    assert!(k.handle_fpu_fault());

    assert_eq!(host::fpu_restore_count(), restores + 1);
    assert_eq!(host::fpu_save_count(), saves);
    assert!(k.task(a).unwrap().fpu_used());
    // A repeated fault by the owner moves nothing.
    assert!(k.handle_fpu_fault());
    assert_eq!(host::fpu_restore_count(), restores + 1);
}

#[test]
fn migration_saves_fpu_of_local_owner_once() {
    let k = SchedFixture::new(2);
    let a = fpu_owner_scenario(&k);
    let saves = host::fpu_save_count();

    let mut frame = TaskContext::zero();
    assert!(k.schedule_in_interrupt(&mut frame));
    assert_eq!(k.task_residence(a), Some(Residence::Ready(1)));
    assert_eq!(host::fpu_save_count(), saves + 1);
    assert_eq!(k.scheduler(0).lock().fpu_owner, TaskId::INVALID);

    let task = k.task(a).unwrap();
    assert!(task.fpu_used());
    assert_eq!(unsafe { *task.fpu_area() }, host::fpu_registers());
}

#[test]
fn remote_fpu_owner_stays_on_its_core() {
    let k = SchedFixture::new(2);
    let a = fpu_owner_scenario(&k);
    assert!(k.wait_task(a));
    assert_eq!(k.task_residence(a), Some(Residence::Waiting));
    let saves = host::fpu_save_count();

    // Woken from core 1 while its registers are still in core 0's FPU.
    host::set_current_core(1);
    assert!(k.notify_task(a));
    host::set_current_core(0);

    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
    assert_eq!(host::fpu_save_count(), saves);
    assert_eq!(k.scheduler(0).lock().fpu_owner, a);
}

#[test]
fn repinned_fpu_owner_moves_after_its_next_run() {
    let k = SchedFixture::new(2);
    let a = fpu_owner_scenario(&k);
    assert!(k.schedule());
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
    let saves = host::fpu_save_count();

    // Re-pinned from core 1 while its registers are in core 0's FPU.
    host::set_current_core(1);
    assert!(k.change_task_affinity(a, Affinity::Core(1)));
    host::set_current_core(0);
    assert_eq!(k.task_residence(a), Some(Residence::Ready(0)));
    assert_eq!(host::fpu_save_count(), saves);

    while k.current_task_id() != a {
        assert!(k.schedule());
    }
    assert!(k.schedule());
    assert_eq!(k.task_residence(a), Some(Residence::Ready(1)));
    assert_eq!(host::fpu_save_count(), saves + 1);
    assert_eq!(k.scheduler(0).lock().fpu_owner, TaskId::INVALID);
    assert_eq!(unsafe { *k.task(a).unwrap().fpu_area() }, host::fpu_registers());
    assert!(!k.scheduler(0).is_locked());
}

#[test]
fn non_owner_migrates_without_fpu_traffic() {
    let k = SchedFixture::new(2);
    let saves = host::fpu_save_count();
    k.spawn(Priority::Normal, Affinity::Any);
    k.spawn(Priority::Normal, Affinity::Any);
    let moved = k.spawn(Priority::Normal, Affinity::Any);
    assert_eq!(k.task_residence(moved), Some(Residence::Ready(1)));
    assert_eq!(host::fpu_save_count(), saves);
}

// =============================================================================
// Groups
// =============================================================================

#[test]
fn wait_group_releases_lock_and_wakes_in_order() {
    let k = SchedFixture::new(1);
    let group = k.groups.allocate().unwrap();
    let lock = Spinlock::new();

    let w1 = k.spawn(Priority::Normal, Affinity::Any);
    let w2 = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), w1);

    lock.acquire();
    assert!(k.wait_group(group, AnyLock::Spin(&lock)));
    assert_eq!(k.current_task_id(), w2);
    lock.release();

    lock.acquire();
    assert!(k.wait_group(group, AnyLock::Spin(&lock)));
    lock.release();
    assert!(!lock.is_locked());

    assert_eq!(k.task_residence(w1), Some(Residence::Waiting));
    assert_eq!(k.task_residence(w2), Some(Residence::Waiting));
    assert_eq!(k.task(w1).unwrap().wait_group(), group);

    assert!(k.notify_one_in_wait_group(group));
    assert_eq!(k.task_residence(w1), Some(Residence::Ready(0)));
    assert_eq!(k.task(w1).unwrap().wait_group(), GroupId::INVALID);
    assert_eq!(k.task_residence(w2), Some(Residence::Waiting));

    assert!(k.notify_all_in_wait_group(group));
    assert_eq!(k.task_residence(w2), Some(Residence::Ready(0)));
    assert!(!k.notify_one_in_wait_group(group));
}

#[test]
fn wait_group_with_mutex_yields_through_the_kernel() {
    let k = SchedFixture::new(1);
    let group = k.groups.allocate().unwrap();
    let mutex = Mutex::new();
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());

    mutex.lock(&*k);
    assert_eq!(mutex.owner(), w);
    assert!(k.wait_group(group, AnyLock::Mutex(&mutex)));
    assert_eq!(k.task_residence(w), Some(Residence::Waiting));
    assert!(!k.wait_group(GroupId::INVALID, AnyLock::Mutex(&mutex)));
}

#[test]
fn notify_before_parking_is_not_lost() {
    let k = SchedFixture::new(1);
    let group = k.groups.allocate().unwrap();
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());

    // Flagged but still running, as if notified between flagging and the
    // switch.
    k.park_on(group).unwrap();
    assert!(k.notify_one_in_wait_group(group));
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    assert!(!k.schedule());
    assert_eq!(k.current_task_id(), w);
}

#[test]
fn join_wakes_waiter_once_after_last_target() {
    let k = SchedFixture::new(1);
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let b = k.spawn(Priority::Normal, Affinity::Any);
    let c = k.spawn(Priority::Normal, Affinity::Any);

    assert!(k.join_group(&[b, c], 2));
    assert_eq!(k.current_task_id(), b);
    assert_eq!(k.task_residence(w), Some(Residence::Waiting));
    let group = k.task(w).unwrap().awaited_join();
    assert!(group.is_valid());
    assert!(k.task(c).unwrap().kind().contains(TaskKind::JOIN));

    // b ends itself: one target left, the waiter keeps sleeping.
    assert!(k.end_task(b));
    assert_eq!(k.current_task_id(), c);
    assert_eq!(k.task_residence(w), Some(Residence::Waiting));
    assert_eq!(k.task(w).unwrap().join_count(), 1);

    assert!(k.end_task(c));
    assert_eq!(k.current_task_id(), w);
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    assert_eq!(k.task(w).unwrap().awaited_join(), GroupId::INVALID);

    // The group is gone; a late notification changes nothing.
    assert!(!k.notify_one_in_join_group(group));
    assert_eq!(k.task_residence(w), Some(Residence::Running(0)));
}

#[test]
fn join_on_dead_targets_returns_at_once() {
    let k = SchedFixture::new(1);
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let stale = TaskId::new(99, 3);
    let idle = k.idle_of(0);

    assert!(k.join_group(&[stale, idle], 2));
    assert_eq!(k.current_task_id(), w);
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    assert_eq!(k.task(w).unwrap().awaited_join(), GroupId::INVALID);
}

#[test]
fn join_count_below_targets_wakes_on_first_ending() {
    let k = SchedFixture::new(1);
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let b = k.spawn(Priority::Normal, Affinity::Any);
    let c = k.spawn(Priority::Normal, Affinity::Any);

    assert!(k.join_group(&[b, c], 1));
    assert_eq!(k.task_residence(w), Some(Residence::Waiting));
    assert!(k.end_task(c));
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    // The remaining target is released from the group.
    assert_eq!(k.task(b).unwrap().join_group(), GroupId::INVALID);
    assert!(!k.task(b).unwrap().kind().contains(TaskKind::JOIN));
}

#[test]
fn join_waiter_is_not_confused_with_a_target_mid_stamp() {
    let k = SchedFixture::new(1);
    let x = k.spawn(Priority::Normal, Affinity::Any);
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(x.offset() < w.offset());
    assert!(k.schedule());
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), w);
    let b = k.spawn(Priority::Normal, Affinity::Any);
    let c = k.spawn(Priority::Normal, Affinity::Any);

    assert!(k.join_group(&[b, c], 2));
    let group = k.task(w).unwrap().awaited_join();
    // x carries the group without its JOIN flag yet, as while being stamped.
    k.task(x).unwrap().set_join_group(group);

    assert!(k.end_task(b));
    assert_eq!(k.task(w).unwrap().join_count(), 1);
    assert_eq!(k.task_residence(w), Some(Residence::Waiting));

    assert!(k.end_task(c));
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    assert_eq!(k.task(x).unwrap().join_group(), GroupId::INVALID);
}

#[test]
fn notify_all_disbands_join() {
    let k = SchedFixture::new(1);
    let w = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    let b = k.spawn(Priority::Normal, Affinity::Any);
    let c = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.join_group(&[b, c], 2));
    let group = k.task(w).unwrap().awaited_join();

    assert!(k.notify_all_in_join_group(group));
    assert_eq!(k.task_state(w), Some(TaskState::Ready));
    assert!(!k.task(c).unwrap().kind().contains(TaskKind::JOIN));
    assert_eq!(k.task(c).unwrap().join_group(), GroupId::INVALID);
    assert!(!k.notify_all_in_join_group(group));
}

// =============================================================================
// Idle task
// =============================================================================

static RELEASED: AtomicUsize = AtomicUsize::new(0);

fn count_release(_id: TaskId) {
    RELEASED.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn process_outlives_its_threads() {
    let k = SchedFixture::new(1);
    assert!(k.register_release_hook(count_release));
    let memory = k.allocator.allocate(0x4000).unwrap();
    let p = k.create_task(
        TaskKind::PROCESS,
        Priority::Normal,
        memory,
        0x5000,
        Affinity::Any,
    );
    assert!(k.schedule());
    let t1 = k.create_thread(0x6000, 1, Affinity::Any, 0);
    let t2 = k.create_thread(0x6000, 2, Affinity::Any, 0);
    let stacks = [t1, t2].map(|t| k.task(t).unwrap().resources().stack);
    let p_stack = k.task(p).unwrap().resources().stack;

    // p yields to t1, t1 ends p, then both threads block so idle runs.
    assert!(k.schedule());
    assert_eq!(k.current_task_id(), t1);
    assert!(k.end_task(p));
    assert!(k.wait_task(t1));
    assert_eq!(k.current_task_id(), t2);
    assert!(k.wait_task(t2));
    assert_eq!(k.current_task_id(), k.idle_of(0));

    // First pass ends the threads and re-queues the process behind them.
    assert_eq!(k.reclaim_ending(k.scheduler(0)), 0);
    assert!(k.exist_task(p));
    assert_eq!(k.task_state(t1), Some(TaskState::Ending));
    assert!(k.allocator.is_live(memory));

    assert_eq!(k.reclaim_ending(k.scheduler(0)), 3);
    for id in [p, t1, t2] {
        assert!(!k.exist_task(id));
    }
    let freed = k.allocator.freed();
    let position = |region: MemRegion| freed.iter().position(|r| *r == region).unwrap();
    assert!(position(stacks[0]) < position(memory));
    assert!(position(stacks[1]) < position(memory));
    assert!(position(memory) < position(p_stack));
    assert_eq!(RELEASED.load(Ordering::Relaxed), 3);
    assert_eq!(k.task_count(), 1);
}

#[test]
fn idle_iteration_samples_load_and_halts_inversely() {
    let k = SchedFixture::new(1);
    let max = k.config().max_halt_cycles as u64;

    host::set_ticks(100);
    let halts = host::halt_count();
    k.idle_iteration();
    assert_eq!(k.get_processor_load(0), 0);
    assert_eq!(host::halt_count() - halts, max);

    // Busy for 100 of the next 300 ticks.
    let now = cpu::ticks();
    let a = k.spawn(Priority::Normal, Affinity::Any);
    assert!(k.schedule());
    host::set_ticks(now + 100);
    assert!(k.wait_task(a));
    host::set_ticks(now + 200);

    let halts = host::halt_count();
    k.idle_iteration();
    // Window since the last sample: 100 busy ticks out of 300.
    assert_eq!(k.get_processor_load(0), 34);
    assert_eq!(host::halt_count() - halts, max * 66 / 100);
}

#[test]
fn idle_stops_halting_once_work_arrives() {
    let k = SchedFixture::new(1);
    k.spawn(Priority::Normal, Affinity::Any);
    let halts = host::halt_count();
    host::set_ticks(50);
    k.idle_iteration();
    assert_eq!(host::halt_count(), halts);
    assert_ne!(k.current_task_id(), k.idle_of(0));
}

// =============================================================================
// Cross-core
// =============================================================================

#[test]
fn cores_create_and_reclaim_concurrently() {
    let k = SchedFixture::new(4);
    thread::scope(|scope| {
        for core in 0..4 {
            let k = &k;
            scope.spawn(move || {
                host::install();
                host::set_current_core(core);
                for _ in 0..20 {
                    let id = k.create_task(
                        TaskKind::SYSTEM,
                        Priority::Normal,
                        MemRegion::EMPTY,
                        0x4000,
                        Affinity::Core(core as u32),
                    );
                    if id.is_valid() {
                        assert!(k.end_task(id));
                    }
                    k.reclaim_ending(k.scheduler(core));
                }
            });
        }
    });
    assert_eq!(k.task_count(), 4);
    assert_eq!(k.allocator.live_count(), 0);
    for core in 0..4 {
        assert!(!k.scheduler(core).is_locked());
        assert_eq!(k.scheduler(core).lock().end_len(), 0);
    }
}

#[test]
fn join_completes_while_targets_end_on_other_cores() {
    for _ in 0..20 {
        let k = SchedFixture::new(4);
        let w = k.spawn(Priority::Normal, Affinity::Core(0));
        assert!(k.schedule());
        assert_eq!(k.current_task_id(), w);

        let targets: Vec<(usize, TaskId)> = (1..4)
            .flat_map(|core| (0..4).map(move |_| core))
            .map(|core| (core, k.spawn(Priority::Normal, Affinity::Core(core as u32))))
            .collect();
        let ids: Vec<TaskId> = targets.iter().map(|&(_, id)| id).collect();

        thread::scope(|scope| {
            for core in 1..4 {
                let (k, targets) = (&k, &targets);
                scope.spawn(move || {
                    host::install();
                    host::set_current_core(core);
                    for &(_, id) in targets.iter().filter(|&&(c, _)| c == core) {
                        assert!(k.end_task(id));
                    }
                });
            }
            assert!(k.join_group(&ids, ids.len()));
        });

        assert_eq!(k.task_state(w), Some(TaskState::Ready));
        assert_eq!(k.task(w).unwrap().awaited_join(), GroupId::INVALID);
        assert!(k.pool.live().all(|task| task.join_group() == GroupId::INVALID));
        for core in 0..4 {
            assert!(!k.scheduler(core).is_locked());
        }
    }
}
