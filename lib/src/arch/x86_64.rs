//! x86_64 platform: local APIC ids for core numbering, CR0.TS as the lazy
//! FPU trap, FXSAVE64/FXRSTOR64 for the register file and a naked register
//! switch that resumes every context through `iretq`.

use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use ::x86_64::instructions::interrupts;
use ::x86_64::registers::control::{Cr0, Cr0Flags};
use kestrel_abi::{FpuState, MAX_CORES, TaskContext};

use crate::cpu::{self, Cpu};

const UNMAPPED_APIC: u32 = u32::MAX;

pub struct X86Cpu {
    apic_ids: [AtomicU32; MAX_CORES],
    online: AtomicUsize,
    ticks: [AtomicU64; MAX_CORES],
}

pub static X86_CPU: X86Cpu = X86Cpu::new();

/// Installs [`X86_CPU`] and maps the bootstrap processor to core 0.
pub fn install() -> bool {
    X86_CPU.register_current_core(0);
    cpu::install(&X86_CPU)
}

impl X86Cpu {
    pub const fn new() -> Self {
        Self {
            apic_ids: [const { AtomicU32::new(UNMAPPED_APIC) }; MAX_CORES],
            online: AtomicUsize::new(0),
            ticks: [const { AtomicU64::new(0) }; MAX_CORES],
        }
    }

    /// Maps the executing processor's APIC id to core `index`. Each
    /// application processor calls this once during bring-up.
    pub fn register_current_core(&self, index: usize) -> bool {
        let Some(slot) = self.apic_ids.get(index) else {
            return false;
        };
        slot.store(local_apic_id(), Ordering::Release);
        self.online.fetch_max(index + 1, Ordering::AcqRel);
        true
    }

    /// Tick bookkeeping; the timer vector calls this before entering the
    /// scheduler.
    pub fn on_timer_interrupt(&self) {
        if let Some(counter) = self.ticks.get(self.current_core()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for X86Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn local_apic_id() -> u32 {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    #[allow(unused_unsafe)]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ebx >> 24
}

/// Runs `f` with CR0.TS clear so FXSAVE/FXRSTOR do not fault.
fn with_fpu_untrapped(f: impl FnOnce()) {
    let flags = Cr0::read();
    let trapped = flags.contains(Cr0Flags::TASK_SWITCHED);
    if trapped {
        // SAFETY: clearing TS only re-enables FPU instructions.
        unsafe { Cr0::write(flags - Cr0Flags::TASK_SWITCHED) };
    }
    f();
    if trapped {
        // SAFETY: restores the value read above.
        unsafe { Cr0::write(flags) };
    }
}

impl Cpu for X86Cpu {
    fn current_core(&self) -> usize {
        let apic = local_apic_id();
        let online = self.online.load(Ordering::Acquire).min(MAX_CORES);
        self.apic_ids[..online]
            .iter()
            .position(|id| id.load(Ordering::Relaxed) == apic)
            .unwrap_or(0)
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts(&self) -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }

    fn ticks(&self) -> u64 {
        self.ticks
            .get(self.current_core())
            .map_or(0, |t| t.load(Ordering::Relaxed))
    }

    fn halt(&self) {
        let was_enabled = interrupts::are_enabled();
        interrupts::enable_and_hlt();
        if !was_enabled {
            interrupts::disable();
        }
    }

    fn save_fpu(&self, area: &mut FpuState) {
        let ptr = area.as_mut_ptr();
        with_fpu_untrapped(|| {
            // SAFETY: `FpuState` is a 16-byte aligned 512-byte FXSAVE area.
            unsafe { asm!("fxsave64 [{}]", in(reg) ptr, options(nostack, preserves_flags)) };
        });
    }

    fn restore_fpu(&self, area: &FpuState) {
        let ptr = area.as_ptr();
        with_fpu_untrapped(|| {
            // SAFETY: the area was produced by FXSAVE64 or `FpuState::new`.
            unsafe { asm!("fxrstor64 [{}]", in(reg) ptr, options(nostack, preserves_flags)) };
        });
    }

    fn set_fpu_trap(&self, armed: bool) {
        // SAFETY: TS only controls whether the next FPU instruction raises #NM.
        unsafe { Cr0::update(|flags| flags.set(Cr0Flags::TASK_SWITCHED, armed)) };
    }

    fn entry_trampoline(&self) -> u64 {
        task_entry_trampoline as usize as u64
    }

    unsafe fn switch_context(&self, prev: *mut TaskContext, next: *const TaskContext) {
        switch_registers(prev, next);
    }
}

// =============================================================================
// Register switch
// =============================================================================

/// Saves the caller's registers into `prev` as a complete return frame and
/// resumes `next`, whichever path saved it.
///
/// The resume hook runs on `next`'s stack before any of its registers are
/// loaded. It drops the scheduler lock the switching side still holds, so
/// a context that was interrupted (and will not release the lock itself)
/// resumes with the lock free. `next` is then restored with `iretq`, which
/// also reloads its interrupt flag.
#[unsafe(naked)]
extern "sysv64" fn switch_registers(prev: *mut TaskContext, next: *const TaskContext) {
    naked_asm!(
        // rdi = prev (may be null on the very first switch), rsi = next
        "test rdi, rdi",
        "jz 2f",

        "mov [rdi + {off_rax}], rax",
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rcx}], rcx",
        "mov [rdi + {off_rdx}], rdx",
        "mov [rdi + {off_rsi}], rsi",
        "mov [rdi + {off_rdi}], rdi",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_r8}], r8",
        "mov [rdi + {off_r9}], r9",
        "mov [rdi + {off_r10}], r10",
        "mov [rdi + {off_r11}], r11",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",

        // Resume as if this call had returned.
        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + {off_rsp}], rax",

        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        "xor eax, eax",
        "mov ax, cs",
        "mov [rdi + {off_cs}], rax",
        "mov ax, ss",
        "mov [rdi + {off_ss}], rax",

        // From here on only `next` (in rbx) is touched.
        "2:",
        "mov rbx, rsi",
        "mov rsp, [rbx + {off_rsp}]",
        // Stay clear of anything the interrupted code kept below its rsp.
        "sub rsp, 128",
        "and rsp, -16",
        "call {resume}",

        "push QWORD PTR [rbx + {off_ss}]",
        "push QWORD PTR [rbx + {off_rsp}]",
        "push QWORD PTR [rbx + {off_rflags}]",
        "push QWORD PTR [rbx + {off_cs}]",
        "push QWORD PTR [rbx + {off_rip}]",

        "mov rax, [rbx + {off_rax}]",
        "mov rcx, [rbx + {off_rcx}]",
        "mov rdx, [rbx + {off_rdx}]",
        "mov rsi, [rbx + {off_rsi}]",
        "mov rdi, [rbx + {off_rdi}]",
        "mov rbp, [rbx + {off_rbp}]",
        "mov r8, [rbx + {off_r8}]",
        "mov r9, [rbx + {off_r9}]",
        "mov r10, [rbx + {off_r10}]",
        "mov r11, [rbx + {off_r11}]",
        "mov r12, [rbx + {off_r12}]",
        "mov r13, [rbx + {off_r13}]",
        "mov r14, [rbx + {off_r14}]",
        "mov r15, [rbx + {off_r15}]",
        "mov rbx, [rbx + {off_rbx}]",
        "iretq",

        resume = sym switch_resume,
        off_rax = const offset_of!(TaskContext, rax),
        off_rbx = const offset_of!(TaskContext, rbx),
        off_rcx = const offset_of!(TaskContext, rcx),
        off_rdx = const offset_of!(TaskContext, rdx),
        off_rsi = const offset_of!(TaskContext, rsi),
        off_rdi = const offset_of!(TaskContext, rdi),
        off_rbp = const offset_of!(TaskContext, rbp),
        off_rsp = const offset_of!(TaskContext, rsp),
        off_r8 = const offset_of!(TaskContext, r8),
        off_r9 = const offset_of!(TaskContext, r9),
        off_r10 = const offset_of!(TaskContext, r10),
        off_r11 = const offset_of!(TaskContext, r11),
        off_r12 = const offset_of!(TaskContext, r12),
        off_r13 = const offset_of!(TaskContext, r13),
        off_r14 = const offset_of!(TaskContext, r14),
        off_r15 = const offset_of!(TaskContext, r15),
        off_rip = const offset_of!(TaskContext, rip),
        off_rflags = const offset_of!(TaskContext, rflags),
        off_cs = const offset_of!(TaskContext, cs),
        off_ss = const offset_of!(TaskContext, ss),
    );
}

extern "sysv64" fn switch_resume() {
    cpu::run_resume_hook();
}

/// First code a new task runs (see [`TaskContext::for_entry`]). Entered by
/// `iretq` with interrupts on and the scheduler lock already released.
///
/// r12 = entry, r13 = argument, r14 = exit routine the entry returns to.
#[unsafe(naked)]
extern "sysv64" fn task_entry_trampoline() {
    naked_asm!("mov rdi, r13", "push r14", "jmp r12");
}
