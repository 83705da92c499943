//! Task lifecycle and the public task-management surface.
//!
//! Every operation here resolves its target through the validated lookup,
//! works under that core's lock, and reports failures as the sentinel the
//! caller expects (`TaskId::INVALID` or `false`) after logging the cause.

use kestrel_abi::{
    Affinity, GroupId, MemRegion, Priority, TaskContext, TaskFlags, TaskId, TaskKind, TaskState,
};
use kestrel_lib::{cpu, klog_debug, klog_info};

use super::kernel::{Kernel, exit_current_task};
use super::task::{Residence, Task, TaskResources};
use crate::error::{SchedError, SchedResult};

/// Kind bits a thread inherits from its process.
const INHERITED_KINDS: TaskKind = TaskKind::SYSTEM.union(TaskKind::USER).union(TaskKind::GUI);

/// Outcome of flagging a task Ending.
struct Ended {
    /// Join group the task was a target of, to be notified once unlocked.
    join_group: GroupId,
    /// The task is the caller itself and must leave the core.
    is_current: bool,
}

impl Kernel {
    // =========================================================================
    // Creation
    // =========================================================================

    /// Creates a task with its own stack and queues it, balanced, from the
    /// calling core. The entry function receives `0` and returns into
    /// [`exit_current_task`].
    pub fn create_task(
        &self,
        kind: TaskKind,
        priority: Priority,
        memory: MemRegion,
        entry: u64,
        affinity: Affinity,
    ) -> TaskId {
        let result = self.spawn(kind, priority, memory, entry, affinity);
        self.settle_id("create_task", result)
    }

    fn spawn(
        &self,
        kind: TaskKind,
        priority: Priority,
        memory: MemRegion,
        entry: u64,
        affinity: Affinity,
    ) -> SchedResult<TaskId> {
        self.check_affinity(affinity)?;
        let source = self.this_core()?;

        let (task, stack) = self.allocate_task()?;
        task.set_flags(TaskFlags::new(priority, kind));
        task.set_affinity(affinity);
        task.set_resources(TaskResources {
            memory,
            stack,
            parent: TaskId::INVALID,
        });
        let ctx = TaskContext::for_entry(
            cpu::entry_trampoline(),
            entry,
            0,
            stack.end() as u64,
            exit_current_task as usize as u64,
        );
        // SAFETY: the id has not been handed out yet, nothing else sees the task.
        unsafe { task.set_context(ctx) };

        self.submit(task, source.lock());
        klog_debug!(
            "sched: created task {} ({:?}, {:?})",
            task.id(),
            kind,
            priority
        );
        Ok(task.id())
    }

    /// Creates a thread of the calling task's process. The thread shares the
    /// process memory, inherits its priority, starts at `entry(arg)` and
    /// returns into `exit_fn` (the default exit routine when `0`).
    pub fn create_thread(&self, entry: u64, arg: u64, affinity: Affinity, exit_fn: u64) -> TaskId {
        let result = self.spawn_thread(entry, arg, affinity, exit_fn);
        self.settle_id("create_thread", result)
    }

    fn spawn_thread(
        &self,
        entry: u64,
        arg: u64,
        affinity: Affinity,
        exit_fn: u64,
    ) -> SchedResult<TaskId> {
        self.check_affinity(affinity)?;
        let source = self.this_core()?;
        let current = self.current_task()?;

        let parent_id = if current.flags().is_process() {
            current.id()
        } else {
            current.resources().parent
        };
        let parent = self
            .pool
            .get(parent_id)
            .filter(|parent| parent.flags().is_process())
            .ok_or(SchedError::ParentGone { parent: parent_id })?;

        let (task, stack) = self.allocate_task()?;
        task.set_flags(TaskFlags::new(
            parent.priority(),
            TaskKind::THREAD | (parent.kind() & INHERITED_KINDS),
        ));
        task.set_affinity(affinity);
        task.set_resources(TaskResources {
            memory: parent.resources().memory,
            stack,
            parent: parent_id,
        });
        let return_to = match exit_fn {
            0 => exit_current_task as usize as u64,
            addr => addr,
        };
        let ctx = TaskContext::for_entry(
            cpu::entry_trampoline(),
            entry,
            arg,
            stack.end() as u64,
            return_to,
        );
        // SAFETY: the id has not been handed out yet, nothing else sees the task.
        unsafe { task.set_context(ctx) };

        // The parent check and the link happen under the child-list lock, so
        // reclamation of an ending parent never misses a late thread.
        let linked = {
            let mut children = parent.children.lock();
            parent.id() == parent_id
                && parent.state() != TaskState::Ending
                && children.push_back(&self.pool.children_arena(), task.offset())
        };
        if !linked {
            self.discard_task(task, stack);
            return Err(SchedError::ParentGone { parent: parent_id });
        }

        self.submit(task, source.lock());
        klog_debug!("sched: created thread {} of {}", task.id(), parent_id);
        Ok(task.id())
    }

    fn check_affinity(&self, affinity: Affinity) -> SchedResult {
        match affinity.core() {
            Some(core) if core >= self.cores.len() => Err(SchedError::InvalidCore { core }),
            _ => Ok(()),
        }
    }

    /// Takes a pool slot and a stack; nothing is held on failure.
    fn allocate_task(&self) -> SchedResult<(&Task, MemRegion)> {
        let id = self.pool.allocate()?;
        let task = self.task(id)?;
        let size = self.config.stack_size;
        match self.allocator.allocate(size) {
            Some(stack) => Ok((task, stack)),
            None => {
                self.pool.free(id);
                Err(SchedError::StackAllocationFailed { size })
            }
        }
    }

    fn discard_task(&self, task: &Task, stack: MemRegion) {
        self.allocator.free(stack);
        self.pool.free(task.id());
    }

    /// Brings `core` under scheduling: the code calling this becomes the
    /// core's idle task, pinned to it. Its registers are captured by the
    /// first switch away, so it needs no stack of its own.
    pub fn start_core(&self, core: usize) -> TaskId {
        let result = self.bring_up(core);
        self.settle_id("start_core", result)
    }

    fn bring_up(&self, core: usize) -> SchedResult<TaskId> {
        let mut guard = self.core(core)?.lock();
        if guard.idle.is_valid() {
            return Err(SchedError::WrongState { id: guard.idle });
        }

        let id = self.pool.allocate()?;
        let task = self.task(id)?;
        task.set_flags(TaskFlags::new(
            Priority::Lowest,
            TaskKind::IDLE | TaskKind::SYSTEM,
        ));
        task.set_affinity(Affinity::Core(core as u32));

        guard.idle = id;
        guard.set_running(task);
        guard.enter_idle(cpu::ticks());
        klog_info!("sched: core {} online, idle task {}", core, id);
        Ok(id)
    }

    // =========================================================================
    // Ending
    // =========================================================================

    /// Flags a task Ending and hands it to its core's end list. A task
    /// running on another core only stops at its next pass through the
    /// scheduler; the calling task leaves the core right away.
    pub fn end_task(&self, id: TaskId) -> bool {
        match self.mark_ending(id) {
            Ok(ended) => {
                if ended.join_group.is_valid() {
                    self.notify_one_in_join_group(ended.join_group);
                }
                if ended.is_current {
                    self.schedule();
                }
                true
            }
            Err(err) => self.settle("end_task", Err(err)),
        }
    }

    fn mark_ending(&self, id: TaskId) -> SchedResult<Ended> {
        let (task, mut guard) = self.lock_task_core(id)?;
        if task.is_idle() {
            return Err(SchedError::IdleTask { id });
        }
        let mut ended = Ended {
            join_group: GroupId::INVALID,
            is_current: false,
        };
        if task.state() == TaskState::Ending {
            return Ok(ended);
        }

        if task.join_group().is_valid() {
            ended.join_group = task.join_group();
            task.set_join_group(GroupId::INVALID);
            task.remove_kind(TaskKind::JOIN);
        }
        task.set_state(TaskState::Ending);
        task.set_wait_group(GroupId::INVALID);

        match task.residence() {
            Residence::Ready(_) => {
                guard.remove_ready(&self.pool, task);
                self.add_task_to_ready_list(&mut guard, task);
            }
            Residence::Waiting => {
                self.common.remove(&self.pool, task);
                self.add_task_to_ready_list(&mut guard, task);
            }
            Residence::Running(core) => {
                ended.is_current = core == cpu::current_core() && guard.running == id;
            }
            // In transit: routed by state wherever it lands.
            Residence::Detached | Residence::Ending(_) => {}
        }
        Ok(ended)
    }

    /// Ends the calling task. Never returns.
    pub fn exit_task(&self) -> ! {
        let id = self.current_task_id();
        if id.is_valid() {
            self.end_task(id);
        }
        loop {
            self.schedule();
            cpu::halt();
        }
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Flags a task Waiting. A ready task moves to the wait list at once, a
    /// running one on its next pass through the scheduler; the calling task
    /// switches away immediately.
    pub fn wait_task(&self, id: TaskId) -> bool {
        match self.mark_waiting(id) {
            Ok(is_current) => {
                if is_current {
                    self.schedule();
                }
                true
            }
            Err(err) => self.settle("wait_task", Err(err)),
        }
    }

    fn mark_waiting(&self, id: TaskId) -> SchedResult<bool> {
        let (task, mut guard) = self.lock_task_core(id)?;
        if task.is_idle() {
            return Err(SchedError::IdleTask { id });
        }
        match task.state() {
            TaskState::Ending => return Err(SchedError::WrongState { id }),
            TaskState::Waiting => return Ok(false),
            TaskState::Ready => {}
        }

        task.set_state(TaskState::Waiting);
        match task.residence() {
            Residence::Ready(_) => {
                guard.remove_ready(&self.pool, task);
                self.add_task_to_ready_list(&mut guard, task);
                Ok(false)
            }
            Residence::Running(core) => Ok(core == cpu::current_core() && guard.running == id),
            _ => Ok(false),
        }
    }

    /// Clears a task's Waiting flag. A parked task is re-submitted through
    /// the load balancer; one that has not parked yet simply keeps running.
    pub fn notify_task(&self, id: TaskId) -> bool {
        let result = self.wake(id);
        self.settle("notify_task", result)
    }

    fn wake(&self, id: TaskId) -> SchedResult {
        let (task, guard) = self.lock_task_core(id)?;
        if task.state() != TaskState::Waiting {
            return Err(SchedError::WrongState { id });
        }
        task.set_state(TaskState::Ready);
        if task.residence() == Residence::Waiting {
            self.common.remove(&self.pool, task);
            self.submit(task, guard);
        }
        Ok(())
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn change_task_priority(&self, id: TaskId, priority: Priority) -> bool {
        let result = self.reprioritize(id, priority);
        self.settle("change_task_priority", result)
    }

    fn reprioritize(&self, id: TaskId, priority: Priority) -> SchedResult {
        let (task, mut guard) = self.lock_task_core(id)?;
        if task.is_idle() {
            return Err(SchedError::IdleTask { id });
        }
        if guard.remove_ready(&self.pool, task) {
            task.set_priority(priority);
            guard.push_ready(&self.pool, task);
        } else {
            task.set_priority(priority);
        }
        Ok(())
    }

    /// Re-pins a task. A ready task pinned elsewhere moves right away,
    /// unless its FPU registers are live on another core than the caller's;
    /// then it moves after its next run there, as a running task does when
    /// it next leaves the core.
    pub fn change_task_affinity(&self, id: TaskId, affinity: Affinity) -> bool {
        let result = self.repin(id, affinity);
        self.settle("change_task_affinity", result)
    }

    fn repin(&self, id: TaskId, affinity: Affinity) -> SchedResult {
        self.check_affinity(affinity)?;
        let (task, mut guard) = self.lock_task_core(id)?;
        if task.is_idle() {
            return Err(SchedError::IdleTask { id });
        }
        task.set_affinity(affinity);

        let moves = affinity.core().is_some_and(|core| core != guard.index());
        if moves && guard.remove_ready(&self.pool, task) {
            self.submit(task, guard);
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub(crate) fn current_task(&self) -> SchedResult<&Task> {
        let running = self.this_core()?.running();
        self.pool.get(running).ok_or(SchedError::NoCurrentTask)
    }

    pub fn current_task_id(&self) -> TaskId {
        self.current_task()
            .map(|task| task.id())
            .unwrap_or(TaskId::INVALID)
    }

    /// Ready plus running tasks of `core`, not counting its idle task.
    pub fn get_task_count(&self, core: usize) -> usize {
        let Ok(scheduler) = self.core(core) else {
            return 0;
        };
        let guard = scheduler.lock();
        let running = guard.running.is_valid() && guard.running != guard.idle;
        scheduler.ready_total() + usize::from(running)
    }

    /// Busy percentage of `core` at its last idle-loop sample.
    pub fn get_processor_load(&self, core: usize) -> u32 {
        self.core(core).map(|scheduler| scheduler.load()).unwrap_or(0)
    }

    pub fn exist_task(&self, id: TaskId) -> bool {
        self.pool.get(id).is_some()
    }

    pub fn task_residence(&self, id: TaskId) -> Option<Residence> {
        self.pool.get(id).map(Task::residence)
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.pool.get(id).map(Task::state)
    }

    /// Live tasks, idle tasks included.
    pub fn task_count(&self) -> usize {
        self.pool.used()
    }

    pub fn context_switches(&self, core: usize) -> u64 {
        self.core(core)
            .map(|scheduler| scheduler.context_switches())
            .unwrap_or(0)
    }

    pub fn set_load_balancing(&self, core: usize, enabled: bool) -> bool {
        let result = self.core(core).map(|scheduler| {
            scheduler.set_balancing(enabled);
            klog_debug!(
                "sched: core {} load balancing {}",
                core,
                if enabled { "on" } else { "off" }
            );
        });
        self.settle("set_load_balancing", result)
    }
}
