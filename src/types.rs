//! Newtype wrappers and type aliases for domain concepts.
//!
//! Newtypes for identifiers (tasks, CPUs, control groups) and virtual
//! runtime prevent silent type confusion. Type aliases for plain
//! quantities (timestamps) keep signatures self-documenting without the
//! boilerplate of arithmetic trait impls.

use std::fmt;

use serde::Serialize;

/// Simulated time in nanoseconds.
pub type TimeNs = u64;

pub const NSEC_PER_USEC: TimeNs = 1_000;
pub const NSEC_PER_MSEC: TimeNs = 1_000_000;
pub const NSEC_PER_SEC: TimeNs = 1_000_000_000;

/// Convert milliseconds to nanoseconds.
pub const fn msecs(ms: u64) -> TimeNs {
    ms * NSEC_PER_MSEC
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulator task identifier. User tasks are numbered densely from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Per-CPU stop tasks live above every user task id.
    pub const STOP_BASE: u32 = u32::MAX - 4096;

    pub fn stop(cpu: CpuId) -> Self {
        TaskId(Self::STOP_BASE + cpu.0)
    }

    pub fn is_stop(self) -> bool {
        self.0 >= Self::STOP_BASE
    }

    /// Index into the dense user task table.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier as a forked kernel task would see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Pid(pub i32);

/// Control group identifier. The root group is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Virtual runtime for fair scheduling (weighted nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `entity_before`),
/// so values compare correctly across a u64 wrap as long as they are
/// within half the range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Vruntime(pub u64);

impl PartialOrd for Vruntime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vruntime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl Vruntime {
    /// Signed distance `self - other`.
    pub fn delta(self, other: Vruntime) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vruntime_wrapping_order() {
        assert!(Vruntime(1) > Vruntime(0));
        assert!(Vruntime(0) > Vruntime(u64::MAX));
        assert_eq!(Vruntime(5).delta(Vruntime(7)), -2);
        assert_eq!(Vruntime(3).cmp(&Vruntime(3)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_task_id_ranges() {
        assert_eq!(TaskId(1).index(), 0);
        assert!(!TaskId(1).is_stop());
        assert!(TaskId::stop(CpuId(3)).is_stop());
        assert_eq!(msecs(6), 6_000_000);
    }
}
