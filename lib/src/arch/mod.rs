//! Bare-metal [`Cpu`](crate::cpu::Cpu) implementations.
//!
//! Only compiled for freestanding targets; hosted builds use
//! [`host`](crate::host) instead.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
