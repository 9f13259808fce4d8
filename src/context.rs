//! Machine state shared between the engine and the scheduler.
//!
//! `SimulationContext` owns everything that is not scheduler policy: the
//! virtual clock, the CPUs with their timers and deferred-work flags, the
//! topology and the current domain hierarchy. The scheduler receives it by
//! `&mut` on every call and uses it to read time, to pick CPUs and to ask
//! for deferred work on other CPUs.

use tracing::{debug, trace};

use crate::clock::{TimerId, TimerRegistry, VirtualClock, TICK_NS};
use crate::cpu::SimCpu;
use crate::cpumask::CpuMask;
use crate::fmt::{set_sim_clock, set_sim_cpu_width};
use crate::irq::SoftIrq;
use crate::sched::StopWork;
use crate::topology::{build_sched_domains, SchedDomain, Topology};
use crate::types::{CpuId, TimeNs};

pub struct SimulationContext {
    pub(crate) clock: VirtualClock,
    pub(crate) cpus: Vec<SimCpu>,
    pub(crate) timers: TimerRegistry,
    topology: Topology,
    domains: Vec<Vec<SchedDomain>>,
    partitions: Vec<CpuMask>,
    active_cpu: CpuId,
    /// Stop work queued per CPU, waiting for its stop task to run.
    pub(crate) stop_work: Vec<Option<StopWork>>,
}

impl SimulationContext {
    pub fn new(topology: Topology) -> Self {
        let nr = topology.nr_cpus;
        let cpus = topology.cpus().map(SimCpu::new).collect();
        set_sim_cpu_width(nr);
        let mut ctx = SimulationContext {
            clock: VirtualClock::new(),
            cpus,
            timers: TimerRegistry::new(nr),
            topology,
            domains: Vec::new(),
            partitions: Vec::new(),
            active_cpu: CpuId(0),
            stop_work: (0..nr).map(|_| None).collect(),
        };
        ctx.rebuild_domains();
        ctx.publish();
        ctx
    }

    pub fn now(&self) -> TimeNs {
        self.clock.now()
    }

    pub fn jiffies(&self) -> u64 {
        self.clock.jiffies()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.cpus.len()
    }

    pub fn active_cpu(&self) -> CpuId {
        self.active_cpu
    }

    /// Make `cpu` the CPU on whose behalf subsequent calls execute.
    pub fn change_cpu(&mut self, cpu: CpuId) {
        assert!(cpu.index() < self.cpus.len(), "change to unknown cpu {cpu}");
        self.active_cpu = cpu;
        self.publish();
    }

    /// Keep the log formatter in sync with clock and active CPU.
    pub(crate) fn publish(&self) {
        set_sim_clock(self.clock.now(), Some(self.active_cpu));
    }

    pub(crate) fn advance_clock(&mut self, t: TimeNs) {
        self.clock.advance(t);
        self.publish();
    }

    pub fn cpu(&self, cpu: CpuId) -> &SimCpu {
        &self.cpus[cpu.index()]
    }

    pub fn cpus(&self) -> &[SimCpu] {
        &self.cpus
    }

    pub fn cpu_online(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu.index()).is_some_and(|c| c.online)
    }

    pub fn online_mask(&self) -> CpuMask {
        CpuMask::from_cpus(self.cpus.iter().filter(|c| c.online).map(|c| c.id))
    }

    pub fn possible_mask(&self) -> CpuMask {
        CpuMask::from_cpus(self.cpus.iter().filter(|c| c.possible).map(|c| c.id))
    }

    pub fn online_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.cpus.iter().filter(|c| c.online).map(|c| c.id)
    }

    /// Online CPUs whose tick is stopped.
    pub fn nohz_idle_mask(&self) -> CpuMask {
        CpuMask::from_cpus(
            self.cpus
                .iter()
                .filter(|c| c.online && c.nohz_idle)
                .map(|c| c.id),
        )
    }

    /// Domain hierarchy of `cpu`, lowest level first.
    pub fn sched_domains(&self, cpu: CpuId) -> &[SchedDomain] {
        self.domains.get(cpu.index()).map_or(&[], |d| d.as_slice())
    }

    pub fn partitions(&self) -> &[CpuMask] {
        &self.partitions
    }

    pub(crate) fn set_partitions(&mut self, partitions: Vec<CpuMask>) {
        self.partitions = partitions;
        self.rebuild_domains();
    }

    pub(crate) fn rebuild_domains(&mut self) {
        let online = self.online_mask();
        self.domains = build_sched_domains(&self.topology, &online, &self.partitions);
        debug!(online = %online.to_cpulist(), "rebuilt scheduling domains");
    }

    /// Flag deferred work of `kind` on `cpu`.
    ///
    /// # Panics
    ///
    /// Only scheduler rebalancing and soft timers are simulated; raising
    /// any other kind is fatal.
    pub fn raise_softirq(&mut self, cpu: CpuId, kind: SoftIrq) {
        assert!(
            kind.is_supported(),
            "unsupported softirq {kind:?} raised on cpu {cpu}"
        );
        trace!(cpu = cpu.0, ?kind, "raise softirq");
        self.cpus[cpu.index()].softirq_pending.set(kind);
    }

    /// Lowest-numbered CPU with deferred work pending.
    pub fn first_softirq_cpu(&self) -> Option<CpuId> {
        self.cpus
            .iter()
            .find(|c| !c.softirq_pending.is_empty())
            .map(|c| c.id)
    }

    /// Ask `cpu` to reschedule. A remote request is delivered through a
    /// 1 ns trigger timer on the target CPU.
    pub fn send_reschedule(&mut self, cpu: CpuId) {
        if cpu == self.active_cpu {
            return;
        }
        let now = self.now();
        self.arm_timer_on(cpu, TimerId::Trigger(cpu), now + 1);
    }

    /// Arm `id` on `cpu` at absolute time `expires`.
    pub fn arm_timer_on(&mut self, cpu: CpuId, id: TimerId, expires: TimeNs) {
        if let Some(prev) = self.timers.arm(cpu, id, expires) {
            if prev != cpu {
                self.reprogram(prev);
            }
        }
        self.reprogram(cpu);
    }

    /// Arm `id` on the active CPU, `delta` from now.
    pub fn arm_timer(&mut self, id: TimerId, delta: TimeNs) {
        let expires = self.now() + delta;
        self.arm_timer_on(self.active_cpu, id, expires);
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.cancel(id) {
            Some(cpu) => {
                self.reprogram(cpu);
                true
            }
            None => false,
        }
    }

    pub fn timer_armed(&self, id: TimerId) -> bool {
        self.timers.is_armed(id)
    }

    pub fn timer_expires(&self, id: TimerId) -> Option<TimeNs> {
        self.timers.expires(id)
    }

    /// Program the CPU's event device from its earliest timer. A CPU whose
    /// timers are currently firing keeps its slot cleared until it is done.
    pub(crate) fn reprogram(&mut self, cpu: CpuId) {
        let c = &mut self.cpus[cpu.index()];
        if c.irq_context == crate::cpu::IrqContext::HardIrq {
            return;
        }
        c.next_event = self.timers.next_event(cpu);
    }

    /// Earliest programmed event over all CPUs.
    pub fn next_event(&self) -> TimeNs {
        self.cpus
            .iter()
            .map(|c| c.next_event)
            .min()
            .unwrap_or(crate::clock::KTIME_MAX)
    }

    /// Expiry of the next periodic tick of `cpu` after `now`.
    ///
    /// Ticks land on the jiffy grid, skewed per CPU so that CPUs do not
    /// all take their tick at the same instant.
    pub fn next_tick(&self, cpu: CpuId, after: TimeNs) -> TimeNs {
        let skew = (TICK_NS / 2) / self.nr_cpu_ids() as u64 * cpu.0 as u64;
        let base = (after.saturating_sub(skew) / TICK_NS + 1) * TICK_NS;
        base + skew
    }

    /// Queue stop-machine work for `cpu` and wake its stop task shortly.
    ///
    /// # Panics
    ///
    /// At most one piece of stop work may be pending per CPU.
    pub fn queue_stop_work(&mut self, cpu: CpuId, work: StopWork) {
        let slot = &mut self.stop_work[cpu.index()];
        assert!(
            slot.is_none(),
            "stop work queued on cpu {cpu} while {slot:?} is pending"
        );
        *slot = Some(work);
        let now = self.now();
        self.arm_timer_on(cpu, TimerId::Stop(cpu), now + 1);
    }

    pub fn stop_work_pending(&self, cpu: CpuId) -> bool {
        self.stop_work[cpu.index()].is_some()
    }

    pub(crate) fn set_online(&mut self, cpu: CpuId, online: bool) {
        self.cpus[cpu.index()].online = online;
        self.rebuild_domains();
    }
}
