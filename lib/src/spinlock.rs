use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::cpu;

const NO_OWNER: usize = usize::MAX;

// =============================================================================
// Spinlock - recursive per-core lock
// =============================================================================

/// Core-recursive spinlock that disables interrupts while held.
///
/// Ownership is per core, not per task: a second `lock()` from the core that
/// already holds it only bumps the recursion count. Contention from another
/// core busy-waits and never enters the scheduler, so a spinlock must not be
/// held across a voluntary switch.
///
/// The interrupt state saved by the outermost `lock()` is restored by the
/// matching outermost `unlock()`. Safe to use from interrupt handlers.
pub struct Spinlock {
    locked: AtomicBool,
    owner: AtomicUsize,
    recursion: AtomicU32,
    saved_irq: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            recursion: AtomicU32::new(0),
            saved_irq: AtomicBool::new(false),
        }
    }

    /// Acquire the lock and return an RAII guard releasing it.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_> {
        self.acquire();
        SpinlockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        if self.try_acquire() {
            Some(SpinlockGuard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Raw acquire; pair with [`Spinlock::release`].
    pub fn acquire(&self) {
        let was_enabled = cpu::disable_interrupts();
        let core = cpu::current_core();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.owner.store(core, Ordering::Relaxed);
                self.recursion.store(1, Ordering::Relaxed);
                self.saved_irq.store(was_enabled, Ordering::Relaxed);
                return;
            }
            // Only this core ever stores its own id, and it clears the owner
            // before releasing, so seeing our id means we hold the lock.
            if self.owner.load(Ordering::Relaxed) == core {
                self.recursion.fetch_add(1, Ordering::Relaxed);
                return;
            }
            spin_loop();
        }
    }

    pub fn try_acquire(&self) -> bool {
        let was_enabled = cpu::disable_interrupts();
        let core = cpu::current_core();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(core, Ordering::Relaxed);
            self.recursion.store(1, Ordering::Relaxed);
            self.saved_irq.store(was_enabled, Ordering::Relaxed);
            return true;
        }
        if self.owner.load(Ordering::Relaxed) == core {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        cpu::restore_interrupts(was_enabled);
        false
    }

    /// Raw release. A no-op when the calling core does not hold the lock.
    pub fn release(&self) {
        let was_enabled = cpu::disable_interrupts();

        if !self.locked.load(Ordering::Acquire)
            || self.owner.load(Ordering::Relaxed) != cpu::current_core()
        {
            cpu::restore_interrupts(was_enabled);
            return;
        }

        let depth = self.recursion.load(Ordering::Relaxed);
        if depth > 1 {
            self.recursion.store(depth - 1, Ordering::Relaxed);
            cpu::restore_interrupts(was_enabled);
            return;
        }

        let saved = self.saved_irq.load(Ordering::Relaxed);
        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // Flag before interrupts: a handler on this core must never find the
        // lock ownerless but still set.
        self.locked.store(false, Ordering::Release);
        cpu::restore_interrupts(saved);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_held_by_current_core(&self) -> bool {
        self.is_locked() && self.owner.load(Ordering::Relaxed) == cpu::current_core()
    }

    /// Current recursion depth; 0 when free.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// `!Send`: released on the core that acquired it.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
    _marker: PhantomData<*mut ()>,
}

impl SpinlockGuard<'_> {
    /// Keep the lock held past the guard's lifetime. Whoever resumes on this
    /// core must call [`Spinlock::release`].
    #[inline]
    pub fn leak(self) {
        core::mem::forget(self);
    }
}

impl Drop for SpinlockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

// =============================================================================
// IrqMutex - non-recursive data lock
// =============================================================================

/// Mutex that disables interrupts while held.
/// For leaf data shared by every core (task pool bookkeeping, the common
/// wait list, group-id bitmap). Never re-entered by the holder.
pub struct IrqMutex<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex provides exclusive access through atomic locking with
// interrupts disabled, making it safe to share across contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_irq: bool,
    _marker: PhantomData<*mut ()>,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_irq = cpu::disable_interrupts();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        IrqMutexGuard {
            mutex: self,
            saved_irq,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_irq = cpu::disable_interrupts();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_irq,
                _marker: PhantomData,
            })
        } else {
            cpu::restore_interrupts(saved_irq);
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for IrqMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: guard ensures exclusive access
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: guard ensures exclusive access
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
        cpu::restore_interrupts(self.saved_irq);
    }
}
