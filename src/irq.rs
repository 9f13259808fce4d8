//! Interrupt context bookkeeping and deferred work (softirqs).
//!
//! Timer callbacks run between `irq_enter` and `irq_exit`; work they raise
//! is only flagged. After a CPU's timers have fired, the engine drains all
//! pending deferred work across every CPU until no flag remains, running
//! the current task's behavior after each CPU's handlers since a handler
//! may have changed what runs there.

use tracing::trace;

use crate::clock::TimerId;
use crate::cpu::IrqContext;
use crate::engine::Simulator;
use crate::sched::Scheduler;
use crate::types::CpuId;

/// Bound on drain rounds before deferred work is considered runaway.
pub const MAX_SOFTIRQ_DRAIN_ROUNDS: usize = 10_000;

/// The kernel's deferred-work kinds. Only `Sched` and `HrTimer` have
/// handlers in the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SoftIrq {
    Hi = 0,
    Timer,
    NetTx,
    NetRx,
    Block,
    BlockIopoll,
    Tasklet,
    Sched,
    HrTimer,
    Rcu,
}

pub const NR_SOFTIRQS: usize = 10;

impl SoftIrq {
    const ALL: [SoftIrq; NR_SOFTIRQS] = [
        SoftIrq::Hi,
        SoftIrq::Timer,
        SoftIrq::NetTx,
        SoftIrq::NetRx,
        SoftIrq::Block,
        SoftIrq::BlockIopoll,
        SoftIrq::Tasklet,
        SoftIrq::Sched,
        SoftIrq::HrTimer,
        SoftIrq::Rcu,
    ];

    pub fn is_supported(self) -> bool {
        matches!(self, SoftIrq::Sched | SoftIrq::HrTimer)
    }

    fn bit(self) -> u16 {
        1 << self as u8
    }
}

/// Set of pending deferred-work kinds on one CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftIrqMask(u16);

impl SoftIrqMask {
    pub fn set(&mut self, kind: SoftIrq) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: SoftIrq) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Return the pending kinds in priority order and clear the mask.
    pub fn take(&mut self) -> Vec<SoftIrq> {
        let pending = *self;
        self.0 = 0;
        SoftIrq::ALL
            .into_iter()
            .filter(|k| pending.contains(*k))
            .collect()
    }
}

impl<S: Scheduler> Simulator<S> {
    pub(crate) fn irq_enter(&mut self, cpu: CpuId) {
        let c = &mut self.ctx.cpus[cpu.index()];
        assert!(!c.irqs_disabled, "irq_enter with interrupts disabled on cpu {cpu}");
        c.irqs_disabled = true;
        c.hardirq_depth += 1;
        c.irq_context = IrqContext::HardIrq;
        c.nr_interrupts += 1;
    }

    pub(crate) fn irq_exit(&mut self, cpu: CpuId) {
        let c = &mut self.ctx.cpus[cpu.index()];
        assert!(c.hardirq_depth > 0, "irq_exit without irq_enter on cpu {cpu}");
        c.hardirq_depth -= 1;
        if c.hardirq_depth == 0 {
            c.irq_context = IrqContext::None;
            c.irqs_disabled = false;
        }
    }

    /// Run deferred work on every CPU until none is pending.
    ///
    /// # Panics
    ///
    /// If the work does not reach a fixed point within
    /// `MAX_SOFTIRQ_DRAIN_ROUNDS`, or a handler leaves interrupts disabled.
    pub fn process_all_softirqs(&mut self) {
        let old_cpu = self.ctx.active_cpu();
        let mut rounds = 0;
        while let Some(cpu) = self.ctx.first_softirq_cpu() {
            rounds += 1;
            assert!(
                rounds <= MAX_SOFTIRQ_DRAIN_ROUNDS,
                "deferred work did not converge after {rounds} rounds (cpu {cpu})"
            );
            self.ctx.change_cpu(cpu);
            self.do_softirq(cpu);
            self.current_handler();
        }
        let active = self.ctx.active_cpu();
        assert!(
            !self.ctx.cpu(active).irqs_disabled,
            "deferred work left interrupts disabled on cpu {active}"
        );
        self.ctx.change_cpu(old_cpu);
    }

    fn do_softirq(&mut self, cpu: CpuId) {
        let pending = self.ctx.cpus[cpu.index()].softirq_pending.take();
        self.ctx.cpus[cpu.index()].irq_context = IrqContext::ServingSoftIrq;
        for kind in pending {
            trace!(cpu = cpu.0, ?kind, "softirq");
            match kind {
                SoftIrq::Sched => self.sched.run_rebalance(&mut self.ctx),
                SoftIrq::HrTimer => self.run_soft_timers(cpu),
                other => panic!("no handler for softirq {other:?} on cpu {cpu}"),
            }
        }
        self.ctx.cpus[cpu.index()].irq_context = IrqContext::None;
    }

    fn run_soft_timers(&mut self, cpu: CpuId) {
        let expired = std::mem::take(&mut self.ctx.cpus[cpu.index()].expired_soft_timers);
        for id in expired {
            self.run_timer(id);
        }
    }

    /// Park an expired soft-mode timer until the timer softirq runs.
    pub(crate) fn defer_soft_timer(&mut self, cpu: CpuId, id: TimerId) {
        self.ctx.cpus[cpu.index()].expired_soft_timers.push(id);
        self.ctx.raise_softirq(cpu, SoftIrq::HrTimer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::RefScheduler;
    use crate::topology::{Topology, TopologyKind};

    fn sim() -> Simulator<RefScheduler> {
        Simulator::new(Topology::canned(TopologyKind::DualCpu), RefScheduler::new())
    }

    #[test]
    fn test_irq_nesting_restores_state() {
        let mut s = sim();
        let cpu = CpuId(1);
        s.irq_enter(cpu);
        assert!(s.ctx.cpu(cpu).irqs_disabled);
        assert_eq!(s.ctx.cpu(cpu).irq_context, IrqContext::HardIrq);
        s.irq_exit(cpu);
        assert!(!s.ctx.cpu(cpu).irqs_disabled);
        assert_eq!(s.ctx.cpu(cpu).irq_context, IrqContext::None);
        assert_eq!(s.ctx.cpu(cpu).hardirq_depth, 0);
        assert_eq!(s.ctx.cpu(cpu).nr_interrupts, 1);
    }

    #[test]
    #[should_panic(expected = "irq_exit without irq_enter on cpu 0")]
    fn test_unbalanced_irq_exit() {
        sim().irq_exit(CpuId(0));
    }

    #[test]
    #[should_panic(expected = "irq_enter with interrupts disabled on cpu 1")]
    fn test_irq_enter_with_interrupts_off() {
        let mut s = sim();
        s.irq_enter(CpuId(1));
        s.irq_enter(CpuId(1));
    }

    #[test]
    fn test_drain_clears_every_cpu() {
        let mut s = sim();
        s.ctx.raise_softirq(CpuId(1), SoftIrq::Sched);
        s.ctx.raise_softirq(CpuId(0), SoftIrq::Sched);
        s.process_all_softirqs();
        assert_eq!(s.ctx.first_softirq_cpu(), None);
    }

    #[test]
    fn test_mask_take_in_priority_order() {
        let mut mask = SoftIrqMask::default();
        mask.set(SoftIrq::HrTimer);
        mask.set(SoftIrq::Sched);
        assert!(mask.contains(SoftIrq::Sched));
        assert_eq!(mask.take(), vec![SoftIrq::Sched, SoftIrq::HrTimer]);
        assert!(mask.is_empty());
    }

    #[test]
    fn test_supported_kinds() {
        let supported: Vec<_> = SoftIrq::ALL.into_iter().filter(|k| k.is_supported()).collect();
        assert_eq!(supported, vec![SoftIrq::Sched, SoftIrq::HrTimer]);
    }
}
