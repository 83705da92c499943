//! Execution-environment primitives.
//!
//! The scheduler never touches hardware directly. Everything it needs from
//! the CPU (interrupt flag, core id, tick counter, halting, FPU register
//! file, register-snapshot switching) goes through the [`Cpu`] trait. The
//! platform installs one implementation at boot; the free functions below
//! dispatch to it.
//!
//! Before anything is installed a uniprocessor fallback answers: core 0, no
//! ticks, interrupt state tracked in a flag, FPU and switch operations
//! ignored. That keeps locks usable during the earliest boot steps.

use core::hint::spin_loop;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use kestrel_abi::{FpuState, TaskContext};
use spin::Once;

/// Hardware operations consumed by the lock and scheduler layers.
pub trait Cpu: Sync {
    /// Index of the executing core, `0..core_count`.
    fn current_core(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;

    /// Disables local interrupts and reports whether they were enabled.
    fn disable_interrupts(&self) -> bool;

    /// Re-enables local interrupts if `was_enabled`; never disables them.
    fn restore_interrupts(&self, was_enabled: bool);

    /// Monotonic tick counter of the executing core.
    fn ticks(&self) -> u64;

    /// Stops the core until the next interrupt.
    fn halt(&self);

    fn save_fpu(&self, area: &mut FpuState);

    fn restore_fpu(&self, area: &FpuState);

    /// Arms (or disarms) the fault raised on the next FPU instruction.
    fn set_fpu_trap(&self, armed: bool);

    /// Address new tasks start at; see [`TaskContext::for_entry`].
    fn entry_trampoline(&self) -> u64;

    /// Saves the live registers into `prev` and resumes `next`.
    ///
    /// A platform that really changes stacks runs the resume hook (see
    /// [`register_resume_hook`]) before `next` continues; one that returns
    /// to the caller leaves that to the caller.
    ///
    /// # Safety
    /// Both pointers must stay valid until the switched-out context is
    /// resumed, and interrupts must be disabled.
    unsafe fn switch_context(&self, prev: *mut TaskContext, next: *const TaskContext);
}

struct Uniprocessor {
    irq_enabled: AtomicBool,
}

impl Cpu for Uniprocessor {
    fn current_core(&self) -> usize {
        0
    }

    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Relaxed)
    }

    fn disable_interrupts(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::Relaxed)
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        if was_enabled {
            self.irq_enabled.store(true, Ordering::Relaxed);
        }
    }

    fn ticks(&self) -> u64 {
        0
    }

    fn halt(&self) {
        spin_loop();
    }

    fn save_fpu(&self, _area: &mut FpuState) {}

    fn restore_fpu(&self, _area: &FpuState) {}

    fn set_fpu_trap(&self, _armed: bool) {}

    fn entry_trampoline(&self) -> u64 {
        0
    }

    unsafe fn switch_context(&self, _prev: *mut TaskContext, _next: *const TaskContext) {}
}

static UNIPROCESSOR: Uniprocessor = Uniprocessor {
    irq_enabled: AtomicBool::new(true),
};

static PLATFORM: Once<&'static dyn Cpu> = Once::new();

/// Installs the platform implementation. The first call wins; returns
/// whether `cpu` is now the active platform.
pub fn install(cpu: &'static dyn Cpu) -> bool {
    let active = PLATFORM.call_once(|| cpu);
    core::ptr::addr_eq(*active as *const dyn Cpu, cpu as *const dyn Cpu)
}

#[inline]
pub fn platform() -> &'static dyn Cpu {
    match PLATFORM.get() {
        Some(cpu) => *cpu,
        None => &UNIPROCESSOR,
    }
}

#[inline]
pub fn current_core() -> usize {
    platform().current_core()
}

#[inline]
pub fn are_interrupts_enabled() -> bool {
    platform().interrupts_enabled()
}

/// Disable interrupts and return whether they were enabled (irqsave pattern).
#[inline]
pub fn disable_interrupts() -> bool {
    platform().disable_interrupts()
}

/// Only re-enables interrupts if they were enabled when saved.
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    platform().restore_interrupts(was_enabled)
}

#[inline]
pub fn ticks() -> u64 {
    platform().ticks()
}

#[inline]
pub fn halt() {
    platform().halt()
}

#[inline]
pub fn save_fpu(area: &mut FpuState) {
    platform().save_fpu(area)
}

#[inline]
pub fn restore_fpu(area: &FpuState) {
    platform().restore_fpu(area)
}

#[inline]
pub fn set_fpu_trap(armed: bool) {
    platform().set_fpu_trap(armed)
}

#[inline]
pub fn entry_trampoline() -> u64 {
    platform().entry_trampoline()
}

/// # Safety
/// See [`Cpu::switch_context`].
#[inline]
pub unsafe fn switch_context(prev: *mut TaskContext, next: *const TaskContext) {
    unsafe { platform().switch_context(prev, next) }
}

// ---------------------------------------------------------------------------
// Resume hook
// ---------------------------------------------------------------------------

/// Run by a platform register switch on the incoming task's stack, before
/// the incoming registers are loaded. The scheduler uses it to drop the lock
/// the switching side held across the switch.
pub type ResumeHook = fn();

static RESUME_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_resume_hook(hook: ResumeHook) {
    RESUME_HOOK.store(hook as *mut (), Ordering::Release);
}

pub fn run_resume_hook() {
    let ptr = RESUME_HOOK.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only `register_resume_hook` stores into the slot, and it
        // stores valid `ResumeHook` fn pointers.
        let hook: ResumeHook = unsafe { core::mem::transmute(ptr) };
        hook();
    }
}

// ---------------------------------------------------------------------------
// IrqGuard
// ---------------------------------------------------------------------------

/// Disables interrupts for its lifetime and restores the previous state on
/// drop. `!Send`: must be dropped on the core that created it.
#[must_use = "if unused, interrupts will be immediately restored"]
pub struct IrqGuard {
    was_enabled: bool,
    _marker: PhantomData<*mut ()>,
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        Self {
            was_enabled: disable_interrupts(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline]
    fn drop(&mut self) {
        restore_interrupts(self.was_enabled);
    }
}
