//! Task-recursive mutex and the `AnyLock` selector.
//!
//! Unlike [`Spinlock`], a [`Mutex`] is owned by a *task*: the holder may be
//! migrated between cores and re-lock recursively from anywhere. Contenders
//! yield through the scheduler instead of spinning with interrupts off, so a
//! mutex must never be taken from interrupt context.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use kestrel_abi::TaskId;

use crate::cpu;
use crate::spinlock::Spinlock;

/// What a lock needs from the scheduler: the identity of the caller and a
/// way to give up the core.
pub trait TaskRuntime {
    fn current_task_id(&self) -> TaskId;

    /// Voluntary switch; `false` when nothing else was runnable.
    fn yield_now(&self) -> bool;
}

const NO_OWNER: u64 = TaskId::INVALID.to_raw();

pub struct Mutex {
    locked: AtomicBool,
    owner: AtomicU64,
    recursion: AtomicU32,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            recursion: AtomicU32::new(0),
        }
    }

    /// Acquire on behalf of the calling task, yielding while another task
    /// holds it.
    pub fn lock<R: TaskRuntime + ?Sized>(&self, rt: &R) {
        let me = rt.current_task_id().to_raw();

        loop {
            let was_enabled = cpu::disable_interrupts();
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(me, Ordering::Relaxed);
                self.recursion.store(1, Ordering::Relaxed);
                cpu::restore_interrupts(was_enabled);
                return;
            }
            if self.owner.load(Ordering::Relaxed) == me {
                self.recursion.fetch_add(1, Ordering::Relaxed);
                cpu::restore_interrupts(was_enabled);
                return;
            }
            cpu::restore_interrupts(was_enabled);

            while self.locked.load(Ordering::Relaxed) {
                if !rt.yield_now() {
                    spin_loop();
                }
            }
        }
    }

    pub fn try_lock<R: TaskRuntime + ?Sized>(&self, rt: &R) -> bool {
        let me = rt.current_task_id().to_raw();
        let was_enabled = cpu::disable_interrupts();

        let acquired = if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Relaxed);
            self.recursion.store(1, Ordering::Relaxed);
            true
        } else if self.owner.load(Ordering::Relaxed) == me {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };

        cpu::restore_interrupts(was_enabled);
        acquired
    }

    /// Returns `false` if the calling task does not hold the mutex.
    pub fn unlock<R: TaskRuntime + ?Sized>(&self, rt: &R) -> bool {
        let me = rt.current_task_id().to_raw();
        let was_enabled = cpu::disable_interrupts();

        if !self.locked.load(Ordering::Acquire) || self.owner.load(Ordering::Relaxed) != me {
            cpu::restore_interrupts(was_enabled);
            return false;
        }

        let depth = self.recursion.load(Ordering::Relaxed);
        if depth > 1 {
            self.recursion.store(depth - 1, Ordering::Relaxed);
        } else {
            self.recursion.store(0, Ordering::Relaxed);
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            self.locked.store(false, Ordering::Release);
        }

        cpu::restore_interrupts(was_enabled);
        true
    }

    /// RAII form of [`Mutex::lock`].
    pub fn lock_guard<'a, R: TaskRuntime + ?Sized>(&'a self, rt: &'a R) -> MutexGuard<'a, R> {
        self.lock(rt);
        MutexGuard { mutex: self, rt }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn owner(&self) -> TaskId {
        TaskId::from_raw(self.owner.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard<'a, R: TaskRuntime + ?Sized> {
    mutex: &'a Mutex,
    rt: &'a R,
}

impl<R: TaskRuntime + ?Sized> Drop for MutexGuard<'_, R> {
    fn drop(&mut self) {
        self.mutex.unlock(self.rt);
    }
}

// =============================================================================
// AnyLock
// =============================================================================

/// Either lock kind, for APIs that release and re-acquire a caller's lock
/// around a wait.
#[derive(Clone, Copy)]
pub enum AnyLock<'a> {
    Spin(&'a Spinlock),
    Mutex(&'a Mutex),
}

impl AnyLock<'_> {
    pub fn acquire<R: TaskRuntime + ?Sized>(&self, rt: &R) {
        match self {
            AnyLock::Spin(lock) => lock.acquire(),
            AnyLock::Mutex(lock) => lock.lock(rt),
        }
    }

    /// Returns `false` if the caller did not hold the lock.
    pub fn release<R: TaskRuntime + ?Sized>(&self, rt: &R) -> bool {
        match self {
            AnyLock::Spin(lock) => {
                if !lock.is_held_by_current_core() {
                    return false;
                }
                lock.release();
                true
            }
            AnyLock::Mutex(lock) => lock.unlock(rt),
        }
    }

    pub fn is_locked(&self) -> bool {
        match self {
            AnyLock::Spin(lock) => lock.is_locked(),
            AnyLock::Mutex(lock) => lock.is_locked(),
        }
    }
}
