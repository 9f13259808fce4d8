//! Simulated CPU state.

use crate::clock::{TimerId, KTIME_MAX};
use crate::irq::SoftIrqMask;
use crate::types::{CpuId, TimeNs};

/// Current interrupt context on a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqContext {
    /// Normal task execution.
    #[default]
    None,
    /// Inside the timer interrupt.
    HardIrq,
    /// Running deferred work.
    ServingSoftIrq,
}

/// A simulated CPU.
#[derive(Debug)]
pub struct SimCpu {
    pub id: CpuId,
    pub possible: bool,
    pub present: bool,
    /// Offline CPUs receive no ticks and run no tasks.
    pub online: bool,
    /// Expiry currently programmed into this CPU's event device.
    ///
    /// Cleared to `KTIME_MAX` while the CPU's timers fire and
    /// reprogrammed from the timer queue afterwards.
    pub next_event: TimeNs,
    /// Pending deferred-work kinds.
    pub softirq_pending: SoftIrqMask,
    /// Soft-mode timers that expired and wait for the timer softirq.
    pub expired_soft_timers: Vec<TimerId>,
    /// Nesting depth of `irq_enter`.
    pub hardirq_depth: u32,
    pub irqs_disabled: bool,
    pub irq_context: IrqContext,
    /// Periodic tick stopped because the CPU is idle.
    pub nohz_idle: bool,
    /// Number of timer interrupts taken.
    pub nr_interrupts: u64,
}

impl SimCpu {
    pub fn new(id: CpuId) -> Self {
        SimCpu {
            id,
            possible: true,
            present: true,
            online: true,
            next_event: KTIME_MAX,
            softirq_pending: SoftIrqMask::default(),
            expired_soft_timers: Vec::new(),
            hardirq_depth: 0,
            irqs_disabled: false,
            irq_context: IrqContext::None,
            nohz_idle: false,
            nr_interrupts: 0,
        }
    }

    pub fn in_interrupt(&self) -> bool {
        self.irq_context != IrqContext::None
    }
}
