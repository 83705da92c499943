//! Boot-time scheduler configuration.
//!
//! Compile-time defaults, overridable from the kernel command line:
//!
//! ```text
//! sched.cores=4 sched.tasks=32 sched.slice=10 sched.balance=off klog=debug
//! ```

use kestrel_abi::{MAX_CORES, MAX_TASKS, TASK_STACK_SIZE};
use kestrel_lib::KlogLevel;

const DEFAULT_CORE_COUNT: usize = 1;
const DEFAULT_TIME_SLICE: u32 = 10;
const DEFAULT_LOAD_BALANCING: bool = true;
const DEFAULT_BALANCE_THRESHOLD: usize = 2;
const DEFAULT_MAX_HALT_CYCLES: u32 = 100;
const DEFAULT_LOG_LEVEL: KlogLevel = KlogLevel::Info;

/// Smallest stack the scheduler will hand to a task.
pub const MIN_STACK_SIZE: usize = 0x1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedConfig {
    /// Cores managed by this kernel instance, `1..=MAX_CORES`.
    pub core_count: usize,
    /// Task slots, `1..=MAX_TASKS`. Each core's idle task takes one.
    pub task_capacity: usize,
    pub stack_size: usize,
    /// Preemption budget in timer ticks.
    pub time_slice: u32,
    /// Initial load-balancing switch of every core.
    pub load_balancing: bool,
    /// A task migrates only to a core whose ready list is at least this
    /// much shorter than the source core's.
    pub balance_threshold: usize,
    /// Halt cycles the idle task spends per iteration on an unloaded core.
    pub max_halt_cycles: u32,
    pub log_level: KlogLevel,
}

impl SchedConfig {
    pub const fn new() -> Self {
        Self {
            core_count: DEFAULT_CORE_COUNT,
            task_capacity: MAX_TASKS,
            stack_size: TASK_STACK_SIZE,
            time_slice: DEFAULT_TIME_SLICE,
            load_balancing: DEFAULT_LOAD_BALANCING,
            balance_threshold: DEFAULT_BALANCE_THRESHOLD,
            max_halt_cycles: DEFAULT_MAX_HALT_CYCLES,
            log_level: DEFAULT_LOG_LEVEL,
        }
    }

    pub const fn with_cores(mut self, core_count: usize) -> Self {
        self.core_count = core_count;
        self
    }

    /// Clamps every field into its supported range.
    pub fn normalized(mut self) -> Self {
        self.core_count = self.core_count.clamp(1, MAX_CORES);
        self.task_capacity = self.task_capacity.clamp(1, MAX_TASKS);
        self.stack_size = self.stack_size.max(MIN_STACK_SIZE);
        self.time_slice = self.time_slice.max(1);
        self
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

fn parse_size(value: &str) -> Option<usize> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return usize::from_str_radix(hex, 16).ok();
    }
    if let Some(kib) = value
        .strip_suffix('K')
        .or_else(|| value.strip_suffix('k'))
    {
        return kib.parse::<usize>().ok()?.checked_mul(1024);
    }
    value.parse().ok()
}

/// Unknown tokens and malformed values are ignored; results are normalized.
pub fn config_from_cmdline(cmdline: Option<&str>) -> SchedConfig {
    let mut cfg = SchedConfig::default();
    if let Some(cmdline) = cmdline {
        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("sched.cores=") {
                if let Ok(cores) = value.parse() {
                    cfg.core_count = cores;
                }
            } else if let Some(value) = token.strip_prefix("sched.tasks=") {
                if let Ok(tasks) = value.parse() {
                    cfg.task_capacity = tasks;
                }
            } else if let Some(value) = token.strip_prefix("sched.stack=") {
                if let Some(size) = parse_size(value) {
                    cfg.stack_size = size;
                }
            } else if let Some(value) = token.strip_prefix("sched.slice=") {
                if let Ok(slice) = value.parse() {
                    cfg.time_slice = slice;
                }
            } else if let Some(value) = token.strip_prefix("sched.balance=") {
                if let Some(enabled) = parse_bool(value) {
                    cfg.load_balancing = enabled;
                }
            } else if let Some(value) = token.strip_prefix("sched.threshold=") {
                if let Ok(threshold) = value.parse() {
                    cfg.balance_threshold = threshold;
                }
            } else if let Some(value) = token.strip_prefix("sched.halt=") {
                if let Ok(cycles) = value.parse() {
                    cfg.max_halt_cycles = cycles;
                }
            } else if let Some(value) = token.strip_prefix("klog=") {
                if let Some(level) = KlogLevel::from_name(value) {
                    cfg.log_level = level;
                }
            }
        }
    }
    cfg.normalized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_cmdline() {
        assert_eq!(config_from_cmdline(None), SchedConfig::default().normalized());
    }

    #[test]
    fn parses_every_key() {
        let cfg = config_from_cmdline(Some(
            "quiet sched.cores=4 sched.tasks=20 sched.stack=16K sched.slice=5 \
             sched.balance=off sched.threshold=3 sched.halt=50 klog=debug",
        ));
        assert_eq!(cfg.core_count, 4);
        assert_eq!(cfg.task_capacity, 20);
        assert_eq!(cfg.stack_size, 16 * 1024);
        assert_eq!(cfg.time_slice, 5);
        assert!(!cfg.load_balancing);
        assert_eq!(cfg.balance_threshold, 3);
        assert_eq!(cfg.max_halt_cycles, 50);
        assert_eq!(cfg.log_level, KlogLevel::Debug);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = config_from_cmdline(Some("sched.cores=99 sched.tasks=0 sched.stack=0x10"));
        assert_eq!(cfg.core_count, MAX_CORES);
        assert_eq!(cfg.task_capacity, 1);
        assert_eq!(cfg.stack_size, MIN_STACK_SIZE);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let cfg = config_from_cmdline(Some("sched.cores=many sched.balance=maybe klog=loud"));
        assert_eq!(cfg, SchedConfig::default().normalized());
    }
}
