//! Register snapshots saved across context switches.
//!
//! The scheduler treats both types as opaque: it copies them between tasks
//! and trap frames and hands them to the platform's save/restore primitives.
//! Only the platform layer interprets individual registers.
//!
//! Every [`TaskContext`] is a complete interrupt-return frame, whoever saved
//! it: all general-purpose registers, `rip`, `rsp`, `rflags` and both
//! segment selectors. A context saved by a voluntary switch can be resumed
//! through a trap frame and vice versa.

// --- TaskContext ---

/// CPU register state of a switched-out task. Also the layout of the trap
/// frame the interrupt path saves from and restores into.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub cr3: u64,
}

/// Interrupts enabled, reserved bit 1 set.
pub const RFLAGS_DEFAULT: u64 = 0x202;

/// Kernel code selector (GDT index 1, RPL 0).
pub const KERNEL_CS: u64 = 0x08;

/// Kernel data/stack selector (GDT index 2, RPL 0).
pub const KERNEL_SS: u64 = 0x10;

/// Trap frames share the snapshot layout.
pub type TrapFrame = TaskContext;

impl TaskContext {
    /// All-zero context. Required for `const` contexts where `Default` is unavailable.
    pub const fn zero() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            cr3: 0,
        }
    }

    /// Context for a task that has never run.
    ///
    /// The platform's entry trampoline (`rip`) calls `entry` (`r12`) with
    /// `arg` (`r13`) as its only argument on the fresh stack, with
    /// `return_to` (`r14`) pushed as the return address so an entry function
    /// that returns lands in its exit routine.
    pub const fn for_entry(
        trampoline: u64,
        entry: u64,
        arg: u64,
        stack_top: u64,
        return_to: u64,
    ) -> Self {
        let mut ctx = Self::zero();
        ctx.rip = trampoline;
        ctx.r12 = entry;
        ctx.r13 = arg;
        ctx.r14 = return_to;
        ctx.rsp = stack_top & !0xF;
        ctx.rflags = RFLAGS_DEFAULT;
        ctx.cs = KERNEL_CS;
        ctx.ss = KERNEL_SS;
        ctx
    }

    #[inline]
    pub const fn entry(&self) -> u64 {
        self.r12
    }

    #[inline]
    pub const fn argument(&self) -> u64 {
        self.r13
    }

    /// Address the entry function returns to, see [`TaskContext::for_entry`].
    #[inline]
    pub const fn return_address(&self) -> u64 {
        self.r14
    }
}

// --- FpuState ---

pub const FPU_STATE_SIZE: usize = 512;

// FXSAVE area offsets (Intel SDM Vol. 1, Table 10-2).
const FXSAVE_FCW_OFFSET: usize = 0;
const FXSAVE_MXCSR_OFFSET: usize = 24;

/// FXSAVE area for x87/MMX/SSE state. Must be 16-byte aligned.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub data: [u8; FPU_STATE_SIZE],
}

impl FpuState {
    pub const fn zero() -> Self {
        Self {
            data: [0u8; FPU_STATE_SIZE],
        }
    }

    /// Default FCW (0x037F) and MXCSR (0x1F80), all exceptions masked.
    pub const fn new() -> Self {
        let mut state = Self::zero();
        state.data[FXSAVE_FCW_OFFSET] = 0x7F;
        state.data[FXSAVE_FCW_OFFSET + 1] = 0x03;
        state.data[FXSAVE_MXCSR_OFFSET] = 0x80;
        state.data[FXSAVE_MXCSR_OFFSET + 1] = 0x1F;
        state
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState")
            .field("fcw", &u16::from_le_bytes([self.data[0], self.data[1]]))
            .finish_non_exhaustive()
    }
}

const _: () = {
    assert!(core::mem::align_of::<FpuState>() == 16);
    assert!(core::mem::size_of::<FpuState>() == FPU_STATE_SIZE);
};
