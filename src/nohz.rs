//! Tick-stopped (nohz) residency.
//!
//! For every CPU and for every domain level above it, accumulate the time
//! during which all CPUs of the span had their tick stopped or were
//! offline. Level 0 is the CPU itself; a domain's entry is kept on the
//! first CPU of its span.

use std::io::{self, Write};

use serde::Serialize;

use crate::context::SimulationContext;
use crate::cpumask::CpuMask;
use crate::topology::MAX_DOMAINS;
use crate::types::{CpuId, TimeNs, NSEC_PER_MSEC};

#[derive(Debug, Clone, Copy, Default)]
struct Residency {
    nohz_time: TimeNs,
    last_change: TimeNs,
    nr_nohz: i64,
}

impl Residency {
    fn update(&mut self, now: TimeNs, nr_cpus: usize, delta: i64) {
        if self.nr_nohz == nr_cpus as i64 {
            self.nohz_time += now.saturating_sub(self.last_change);
        }
        self.last_change = now;
        self.nr_nohz += delta;
    }
}

#[derive(Debug, Clone)]
pub struct NohzTracker {
    data: Vec<[Residency; MAX_DOMAINS + 1]>,
}

impl NohzTracker {
    pub fn new(nr_cpus: usize) -> Self {
        NohzTracker {
            data: vec![[Residency::default(); MAX_DOMAINS + 1]; nr_cpus],
        }
    }

    /// Fold the current state of `cpu` into its own entry and the entries
    /// of every domain above it.
    pub fn track(&mut self, ctx: &SimulationContext, cpu: CpuId) {
        let now = ctx.now();
        let c = ctx.cpu(cpu);
        let active = (!c.online || c.nohz_idle) as i64;
        let delta = active - self.data[cpu.index()][0].nr_nohz;
        self.data[cpu.index()][0].update(now, 1, delta);
        for (level, sd) in ctx.sched_domains(cpu).iter().enumerate() {
            let Some(first) = sd.first_cpu() else {
                continue;
            };
            self.data[first.index()][level + 1].update(now, sd.span_weight(), delta);
        }
    }

    /// Tick-stopped time of `cpu` at `level` (0 is the CPU itself).
    pub fn nohz_time(&self, cpu: CpuId, level: usize) -> TimeNs {
        self.data[cpu.index()][level].nohz_time
    }

    /// Percentages for `cpu`: its own, then each domain it is the first
    /// CPU of, bottom-up.
    fn row(&mut self, ctx: &SimulationContext, cpu: CpuId) -> Vec<f64> {
        self.track(ctx, cpu);
        let now = ctx.now() as f64;
        let mut row = vec![self.nohz_time(cpu, 0) as f64 * 100.0 / now];
        for (level, sd) in ctx.sched_domains(cpu).iter().enumerate() {
            if sd.first_cpu() != Some(cpu) {
                break;
            }
            row.push(self.nohz_time(cpu, level + 1) as f64 * 100.0 / now);
        }
        row
    }

    /// Rows in domain hierarchy order: after each CPU, continue with the
    /// lowest domain that still has unprinted CPUs. Returns the printed
    /// rows and the CPUs that no domain reached (offline ones).
    fn hierarchy_order(&mut self, ctx: &SimulationContext) -> (Vec<NohzRow>, Vec<NohzRow>) {
        let mut to_print = ctx.possible_mask();
        let mut rows = Vec::new();
        let mut cpu = to_print.first();
        while let Some(c) = cpu {
            rows.push(NohzRow {
                cpu: c,
                percent: self.row(ctx, c),
            });
            to_print.clear(c);
            cpu = ctx
                .sched_domains(c)
                .iter()
                .find_map(|sd| sd.span.first_and(&to_print));
        }
        let mut offline = Vec::new();
        while let Some(c) = to_print.first() {
            offline.push(NohzRow {
                cpu: c,
                percent: self.row(ctx, c),
            });
            to_print.clear(c);
        }
        (rows, offline)
    }

    pub fn report(&mut self, ctx: &SimulationContext) -> NohzReport {
        let levels = ctx
            .possible_mask()
            .first()
            .map(|c| {
                ctx.sched_domains(c)
                    .iter()
                    .map(|sd| sd.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let (rows, offline) = self.hierarchy_order(ctx);
        NohzReport {
            elapsed_ms: ctx.now() / NSEC_PER_MSEC,
            levels,
            rows,
            offline,
        }
    }

    /// Human-readable residency table.
    pub fn print(&mut self, ctx: &SimulationContext, w: &mut dyn Write) -> io::Result<()> {
        self.report(ctx).print(w)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NohzRow {
    pub cpu: CpuId,
    pub percent: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NohzReport {
    pub elapsed_ms: u64,
    /// Domain level names of the first possible CPU, bottom-up.
    pub levels: Vec<String>,
    pub rows: Vec<NohzRow>,
    pub offline: Vec<NohzRow>,
}

impl NohzReport {
    pub fn print(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "Time spent with tick disabled over {} ms:", self.elapsed_ms)?;
        write!(w, "{:>7} ", "level:")?;
        for name in &self.levels {
            write!(w, "{name:>8} ")?;
        }
        writeln!(w, "{:>8} ", "SYSTEM")?;
        for row in &self.rows {
            row.print(w)?;
        }
        if !self.offline.is_empty() {
            writeln!(w, "currently offline cpus:")?;
            for row in &self.offline {
                row.print(w)?;
            }
        }
        Ok(())
    }
}

impl NohzRow {
    fn print(&self, w: &mut dyn Write) -> io::Result<()> {
        write!(w, "cpu{:>3}: ", self.cpu.0)?;
        for p in &self.percent {
            write!(w, "{p:7.4}% ")?;
        }
        writeln!(w)
    }
}

/// CPUs currently counted as tick-stopped.
pub fn nohz_cpus(ctx: &SimulationContext) -> CpuMask {
    CpuMask::from_cpus(
        ctx.cpus()
            .iter()
            .filter(|c| !c.online || c.nohz_idle)
            .map(|c| c.id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Topology, TopologyKind};

    #[test]
    fn test_residency_counts_only_full_spans() {
        let mut ctx = SimulationContext::new(Topology::canned(TopologyKind::DualCpu));
        let mut nohz = NohzTracker::new(2);
        ctx.cpus[0].nohz_idle = true;
        nohz.track(&ctx, CpuId(0));
        ctx.advance_clock(1_000_100);
        ctx.cpus[1].nohz_idle = true;
        nohz.track(&ctx, CpuId(1));
        ctx.advance_clock(3_000_100);
        nohz.track(&ctx, CpuId(0));
        nohz.track(&ctx, CpuId(1));

        assert_eq!(nohz.nohz_time(CpuId(0), 0), 3_000_000);
        assert_eq!(nohz.nohz_time(CpuId(1), 0), 2_000_000);
        // Both CPUs idle only from 1_000_100 on.
        assert_eq!(nohz.nohz_time(CpuId(0), 1), 2_000_000);
        assert_eq!(nohz_cpus(&ctx).weight(), 2);
    }

    #[test]
    fn test_print_walks_hierarchy() {
        let mut ctx = SimulationContext::new(Topology::canned(TopologyKind::QuadCpuDualSocket));
        let mut nohz = NohzTracker::new(ctx.nr_cpu_ids());
        ctx.advance_clock(10_000_000);
        ctx.set_online(CpuId(3), false);
        let mut out = Vec::new();
        nohz.print(&ctx, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Time spent with tick disabled over 10 ms:\n"));
        assert!(text.contains("SYSTEM"));
        assert!(text.contains("currently offline cpus:\ncpu  3:"));
        let printed = text.matches("cpu  ").count();
        assert_eq!(printed, ctx.nr_cpu_ids());
    }
}
