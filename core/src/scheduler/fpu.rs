//! Lazy FPU switching.
//!
//! A context switch never touches the FPU. It only arms a trap when the
//! incoming task is not the core's last FPU user; the first FPU instruction
//! of such a task faults into [`Kernel::handle_fpu_fault`], which moves the
//! register file over.

use kestrel_abi::FpuState;
use kestrel_lib::{IrqGuard, cpu, klog_trace};

use super::kernel::Kernel;

impl Kernel {
    /// Device-not-available handler. Returns `false` if the fault did not
    /// come from a scheduled task.
    pub fn handle_fpu_fault(&self) -> bool {
        let _irq = IrqGuard::new();
        let Ok(core) = self.this_core() else {
            return false;
        };
        let mut guard = core.lock();
        cpu::set_fpu_trap(false);

        let Some(current) = self.pool.get(guard.running) else {
            return false;
        };
        if guard.fpu_owner == current.id() {
            return true;
        }

        // An owner that has since been reclaimed leaves nothing to save.
        if let Some(previous) = self.pool.get(guard.fpu_owner) {
            // SAFETY: the previous owner's registers live in this core's FPU
            // and this core's lock is held.
            cpu::save_fpu(unsafe { previous.fpu_area() });
            previous.set_fpu_used(true);
        }

        if current.fpu_used() {
            // SAFETY: `current` runs on this core under its lock.
            cpu::restore_fpu(unsafe { current.fpu_area() });
        } else {
            cpu::restore_fpu(&FpuState::new());
            current.set_fpu_used(true);
        }

        klog_trace!(
            "sched: core {} FPU {} -> {}",
            guard.index(),
            guard.fpu_owner,
            current.id()
        );
        guard.fpu_owner = current.id();
        true
    }
}
