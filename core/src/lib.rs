//! Kestrel SMP scheduler core
//!
//! Task pool, per-core schedulers, switching, load balancing, groups and the
//! idle task, written against the `kestrel_lib` platform seam.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::{SchedConfig, config_from_cmdline};
pub use error::{SchedError, SchedResult};
pub use scheduler::{Kernel, Residence, exit_current_task, init, kernel};
