//! Simulated execution environment for running the scheduler on a host.
//!
//! Each OS thread plays one core at a time: the core id, interrupt flag,
//! tick counter, FPU register file and "live" register snapshot are all
//! thread-local. `std::thread` therefore stands in for real cores, and every
//! test thread starts from a clean simulated CPU.
//!
//! Register switching copies snapshots and returns immediately; after a
//! `schedule()` the calling thread simply carries on as the incoming task.
//!
//! [`HostAllocator`] hands out fake, never-dereferenced addresses and keeps
//! a ledger of live and freed regions so tests can observe reclamation.

extern crate std;

use std::cell::{Cell, RefCell};
use std::sync::Mutex;
use std::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kestrel_abi::{FpuState, MemRegion, TaskContext};

use crate::cpu::{self, Cpu};
use crate::memory::KernelAllocator;

/// Fake address of the entry trampoline reported to new task contexts.
pub const HOST_TRAMPOLINE: u64 = 0x7000_0000;

std::thread_local! {
    static CORE: Cell<usize> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static TICKS: Cell<u64> = const { Cell::new(0) };
    static HALTS: Cell<u64> = const { Cell::new(0) };
    static FPU_REGS: RefCell<FpuState> = const { RefCell::new(FpuState::new()) };
    static FPU_TRAP: Cell<bool> = const { Cell::new(false) };
    static FPU_SAVES: Cell<u32> = const { Cell::new(0) };
    static FPU_RESTORES: Cell<u32> = const { Cell::new(0) };
    static LIVE: RefCell<TaskContext> = const { RefCell::new(TaskContext::zero()) };
    static SWITCHES: Cell<u64> = const { Cell::new(0) };
}

pub struct HostCpu;

static HOST_CPU: HostCpu = HostCpu;

impl Cpu for HostCpu {
    fn current_core(&self) -> usize {
        CORE.with(Cell::get)
    }

    fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn disable_interrupts(&self) -> bool {
        IRQ_ENABLED.with(|flag| flag.replace(false))
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        if was_enabled {
            IRQ_ENABLED.with(|flag| flag.set(true));
        }
    }

    fn ticks(&self) -> u64 {
        TICKS.with(Cell::get)
    }

    /// A halted core wakes on the next timer interrupt, one tick later.
    fn halt(&self) {
        HALTS.with(|h| h.set(h.get() + 1));
        TICKS.with(|t| t.set(t.get() + 1));
    }

    fn save_fpu(&self, area: &mut FpuState) {
        FPU_REGS.with(|regs| *area = *regs.borrow());
        FPU_SAVES.with(|c| c.set(c.get() + 1));
    }

    fn restore_fpu(&self, area: &FpuState) {
        FPU_REGS.with(|regs| *regs.borrow_mut() = *area);
        FPU_RESTORES.with(|c| c.set(c.get() + 1));
    }

    fn set_fpu_trap(&self, armed: bool) {
        FPU_TRAP.with(|trap| trap.set(armed));
    }

    fn entry_trampoline(&self) -> u64 {
        HOST_TRAMPOLINE
    }

    unsafe fn switch_context(&self, prev: *mut TaskContext, next: *const TaskContext) {
        LIVE.with(|live| {
            let mut live = live.borrow_mut();
            // SAFETY: the caller guarantees both snapshots are valid.
            unsafe {
                if !prev.is_null() {
                    *prev = *live;
                }
                if !next.is_null() {
                    *live = *next;
                }
            }
        });
        SWITCHES.with(|c| c.set(c.get() + 1));
    }
}

/// Installs [`HostCpu`] as the platform. Safe to call from every test.
pub fn install() {
    cpu::install(&HOST_CPU);
}

/// Makes the calling thread act as `core`.
pub fn set_current_core(core: usize) {
    CORE.with(|c| c.set(core));
}

pub fn set_ticks(ticks: u64) {
    TICKS.with(|t| t.set(ticks));
}

pub fn advance_ticks(delta: u64) {
    TICKS.with(|t| t.set(t.get() + delta));
}

pub fn halt_count() -> u64 {
    HALTS.with(Cell::get)
}

pub fn fpu_save_count() -> u32 {
    FPU_SAVES.with(Cell::get)
}

pub fn fpu_restore_count() -> u32 {
    FPU_RESTORES.with(Cell::get)
}

pub fn fpu_trap_armed() -> bool {
    FPU_TRAP.with(Cell::get)
}

/// Overwrites the simulated FPU register file, as an FPU instruction would.
pub fn write_fpu_registers(fill: u8) {
    FPU_REGS.with(|regs| regs.borrow_mut().data.fill(fill));
}

pub fn fpu_registers() -> FpuState {
    FPU_REGS.with(|regs| *regs.borrow())
}

/// Registers currently "loaded" on the calling thread's core.
pub fn live_context() -> TaskContext {
    LIVE.with(|live| *live.borrow())
}

pub fn set_live_context(ctx: TaskContext) {
    LIVE.with(|live| *live.borrow_mut() = ctx);
}

pub fn switch_count() -> u64 {
    SWITCHES.with(Cell::get)
}

// ---------------------------------------------------------------------------
// HostAllocator
// ---------------------------------------------------------------------------

const HOST_HEAP_BASE: usize = 0x1000_0000;

#[derive(Default)]
struct Ledger {
    live: Vec<MemRegion>,
    freed: Vec<MemRegion>,
}

/// Counting allocator with failure injection.
pub struct HostAllocator {
    next: AtomicUsize,
    exhausted: AtomicBool,
    ledger: Mutex<Ledger>,
}

impl HostAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(HOST_HEAP_BASE),
            exhausted: AtomicBool::new(false),
            ledger: Mutex::new(Ledger {
                live: Vec::new(),
                freed: Vec::new(),
            }),
        }
    }

    /// While set, every allocation fails.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    pub fn live_count(&self) -> usize {
        self.ledger.lock().map(|l| l.live.len()).unwrap_or(0)
    }

    pub fn is_live(&self, region: MemRegion) -> bool {
        self.ledger
            .lock()
            .map(|l| l.live.contains(&region))
            .unwrap_or(false)
    }

    /// Order in which regions were returned.
    pub fn freed(&self) -> Vec<MemRegion> {
        self.ledger.lock().map(|l| l.freed.clone()).unwrap_or_default()
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelAllocator for HostAllocator {
    fn allocate(&self, size: usize) -> Option<MemRegion> {
        if size == 0 || self.exhausted.load(Ordering::Relaxed) {
            return None;
        }
        let rounded = (size + 0xFFF) & !0xFFF;
        let base = self.next.fetch_add(rounded, Ordering::Relaxed);
        let region = MemRegion::new(base, size);
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.live.push(region);
        }
        Some(region)
    }

    fn free(&self, region: MemRegion) -> bool {
        let Ok(mut ledger) = self.ledger.lock() else {
            return false;
        };
        match ledger.live.iter().position(|r| *r == region) {
            Some(pos) => {
                ledger.live.swap_remove(pos);
                ledger.freed.push(region);
                true
            }
            None => false,
        }
    }
}
