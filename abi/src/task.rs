//! Task identity and classification types shared by the scheduler crates.
//!
//! Identifiers are explicit two-field values rather than shifted integers so
//! the generation check that invalidates stale references stays visible at
//! every call site. The packed `u64`/`u32` encodings exist only for storage in
//! atomics.

use core::fmt;

use bitflags::bitflags;

// --- Task Configuration ---

/// Upper bound on task slots; the runtime capacity is configured at boot.
pub const MAX_TASKS: usize = 64;
/// Upper bound on cores managed by one kernel instance.
pub const MAX_CORES: usize = 16;
pub const NUM_PRIORITIES: usize = 5;
pub const TASK_STACK_SIZE: usize = 0x8000; // 32 KiB

// --- TaskId ---

/// Task identifier: `{generation, offset}`.
///
/// `offset` is the slot index in the task pool, `generation` the stamp the
/// slot carried when the task was allocated. A slot with generation zero is
/// free, so `TaskId::INVALID` never names a live task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskId {
    generation: u32,
    offset: u32,
}

impl TaskId {
    pub const INVALID: TaskId = TaskId {
        generation: 0,
        offset: 0,
    };

    #[inline]
    pub const fn new(generation: u32, offset: u32) -> Self {
        Self { generation, offset }
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.generation != 0
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            generation: (raw >> 32) as u32,
            offset: raw as u32,
        }
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.offset as u64
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.generation, self.offset)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.offset)
    }
}

// --- Priority ---

/// Scheduling priority, 0 is serviced first.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Highest = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Lowest = 4,
}

impl Priority {
    pub const ALL: [Priority; NUM_PRIORITIES] = [
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
    ];

    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Highest),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            4 => Some(Self::Lowest),
            _ => None,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

// --- TaskState ---

/// Stored scheduling state. Running and Ready are not stored: they follow
/// from where the task currently sits (see the scheduler's residence record).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Ready = 0,
    Waiting = 1,
    Ending = 2,
}

impl TaskState {
    #[inline]
    const fn from_bits(value: u32) -> Self {
        match value {
            1 => Self::Waiting,
            2 => Self::Ending,
            _ => Self::Ready,
        }
    }
}

// --- TaskKind ---

bitflags! {
    /// Descriptive task attributes; independent of the scheduling state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TaskKind: u16 {
        const SYSTEM  = 0x01;
        const PROCESS = 0x02;
        const THREAD  = 0x04;
        const IDLE    = 0x08;
        const GUI     = 0x10;
        const USER    = 0x20;
        /// Target of a pending join group.
        const JOIN    = 0x40;
    }
}

// --- TaskFlags ---

const PRIORITY_MASK: u32 = 0x7;
const STATE_SHIFT: u32 = 4;
const STATE_MASK: u32 = 0x3;
const KIND_SHIFT: u32 = 16;

/// The task flags word as a typed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TaskFlags {
    pub priority: Priority,
    pub state: TaskState,
    pub kind: TaskKind,
}

impl TaskFlags {
    #[inline]
    pub const fn new(priority: Priority, kind: TaskKind) -> Self {
        Self {
            priority,
            state: TaskState::Ready,
            kind,
        }
    }

    /// Packs the flags for atomic storage.
    #[inline]
    pub const fn to_bits(self) -> u32 {
        (self.priority as u32)
            | ((self.state as u32) << STATE_SHIFT)
            | ((self.kind.bits() as u32) << KIND_SHIFT)
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        let priority = match Priority::from_u8((bits & PRIORITY_MASK) as u8) {
            Some(p) => p,
            None => Priority::Lowest,
        };
        Self {
            priority,
            state: TaskState::from_bits((bits >> STATE_SHIFT) & STATE_MASK),
            kind: TaskKind::from_bits_truncate((bits >> KIND_SHIFT) as u16),
        }
    }

    #[inline]
    pub const fn is_process(self) -> bool {
        self.kind.contains(TaskKind::PROCESS)
    }

    #[inline]
    pub const fn is_thread(self) -> bool {
        self.kind.contains(TaskKind::THREAD)
    }

    #[inline]
    pub const fn is_idle(self) -> bool {
        self.kind.contains(TaskKind::IDLE)
    }
}

// --- Affinity ---

const AFFINITY_ANY_RAW: u32 = u32::MAX;

/// Placement constraint of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Placed by the load balancer.
    #[default]
    Any,
    /// Pinned to one core.
    Core(u32),
}

impl Affinity {
    #[inline]
    pub const fn to_raw(self) -> u32 {
        match self {
            Affinity::Any => AFFINITY_ANY_RAW,
            Affinity::Core(core) => core,
        }
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        if raw == AFFINITY_ANY_RAW {
            Affinity::Any
        } else {
            Affinity::Core(raw)
        }
    }

    #[inline]
    pub const fn core(self) -> Option<usize> {
        match self {
            Affinity::Any => None,
            Affinity::Core(core) => Some(core as usize),
        }
    }
}

// --- MemRegion ---

/// An `(address, size)` pair handed out by the kernel allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MemRegion {
    pub base: usize,
    pub size: usize,
}

impl MemRegion {
    pub const EMPTY: MemRegion = MemRegion { base: 0, size: 0 };

    #[inline]
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.base == 0 || self.size == 0
    }

    /// One past the highest address; stacks grow down from here.
    #[inline]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}
