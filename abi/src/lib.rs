//! Kestrel scheduler ABI types
//!
//! Canonical definitions shared between the lock/platform layer and the
//! scheduler: task and group identifiers, the typed flags word, affinity,
//! memory regions and the opaque register snapshots.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod context;
pub mod group;
pub mod task;

pub use context::*;
pub use group::*;
pub use task::*;
