//! Scheduler error type.
//!
//! Internal operations report *why* they failed; the public `Kernel` surface
//! logs the cause and collapses it into the sentinel its callers expect
//! (`TaskId::INVALID` or `false`).

use core::fmt;

use kestrel_abi::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Every task slot is in use.
    PoolExhausted,
    /// The kernel allocator could not provide a stack.
    StackAllocationFailed { size: usize },
    /// Offset out of range or generation mismatch.
    StaleTask { id: TaskId },
    InvalidCore { core: usize },
    /// The idle task cannot be waited on, ended or migrated.
    IdleTask { id: TaskId },
    /// The operation does not apply in the task's current state.
    WrongState { id: TaskId },
    /// A thread's parent is no longer a live process.
    ParentGone { parent: TaskId },
    /// No task is running on the calling core yet.
    NoCurrentTask,
    GroupsExhausted,
    InvalidGroup,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "task pool exhausted"),
            Self::StackAllocationFailed { size } => {
                write!(f, "stack allocation of {:#x} bytes failed", size)
            }
            Self::StaleTask { id } => write!(f, "task {} does not exist", id),
            Self::InvalidCore { core } => write!(f, "core {} is not managed", core),
            Self::IdleTask { id } => write!(f, "task {} is an idle task", id),
            Self::WrongState { id } => write!(f, "task {} is in the wrong state", id),
            Self::ParentGone { parent } => write!(f, "parent process {} is gone", parent),
            Self::NoCurrentTask => write!(f, "no task running on this core"),
            Self::GroupsExhausted => write!(f, "group identifiers exhausted"),
            Self::InvalidGroup => write!(f, "invalid group identifier"),
        }
    }
}

/// Convenience result type for scheduler operations.
pub type SchedResult<T = ()> = Result<T, SchedError>;
