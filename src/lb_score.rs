//! Load-balance scoring.
//!
//! Independently of the scheduler under test, the scorer computes where a
//! simple greedy placement would put the currently queued fair tasks and
//! compares the resulting per-CPU loads against the scheduler's actual
//! placement. Loads are hierarchical weights: the root distributes 1024
//! over its tasks and child groups in proportion to their weight, and each
//! group does the same with what it received.
//!
//! Scoring runs once per fired batch of events, so results are cached by
//! a rolling hash of the inputs in a small direct-mapped table. A hash
//! collision silently reuses the stale entry.

use std::collections::BTreeMap;
use std::io::Write;

use tracing::trace;

use crate::cpumask::CpuMask;
use crate::engine::Simulator;
use crate::sched::{CfsRqId, SchedPolicy, Scheduler};
use crate::types::{CpuId, GroupId, TaskId, TimeNs};

/// Weight the root group hands out.
pub const ROOT_H_WEIGHT: f64 = 1024.0;

const HASH_TABLE_SIZE: usize = 1023;

/// A queued fair task as the scorer sees it.
#[derive(Debug, Clone)]
pub struct LbTask {
    pub id: TaskId,
    pub cpu: CpuId,
    pub weight: u64,
    pub group: GroupId,
    pub cfs_rq: CfsRqId,
    pub cpus_allowed: CpuMask,
}

/// A group with queued work somewhere below it.
#[derive(Debug, Clone)]
pub struct LbGroup {
    pub id: GroupId,
    pub parent: Option<GroupId>,
    pub shares: u64,
}

/// Hierarchical weights of one scoring pass.
#[derive(Debug, Clone, Default)]
pub struct HWeights {
    /// Per task, in `LbState::tasks` order.
    pub tasks: Vec<f64>,
    /// Per counted group: `(h_weight, total_load)`.
    pub groups: BTreeMap<GroupId, (f64, f64)>,
}

/// Inputs of one scoring pass. Groups are listed parents first.
#[derive(Debug, Clone, Default)]
pub struct LbState {
    pub tasks: Vec<LbTask>,
    pub groups: Vec<LbGroup>,
    /// Online CPUs, ascending.
    pub cpus: Vec<CpuId>,
}

fn mixhash(hash: u64, value: u64) -> u64 {
    hash.wrapping_mul(29).wrapping_add(value)
}

impl LbState {
    /// Rolling hash over everything the score depends on.
    pub fn hash(&self) -> u64 {
        let mut hash = 0;
        for t in &self.tasks {
            hash = mixhash(hash, t.id.0 as u64);
            hash = mixhash(hash, ((t.cfs_rq.cpu.0 as u64) << 32) | t.cfs_rq.group.0 as u64);
            hash = mixhash(hash, t.weight);
            for word in t.cpus_allowed.as_raw_slice() {
                hash = mixhash(hash, *word);
            }
        }
        for g in &self.groups {
            hash = mixhash(hash, g.id.0 as u64 + 1);
            hash = mixhash(hash, g.shares);
        }
        hash
    }

    pub fn h_weights(&self) -> HWeights {
        let mut total: BTreeMap<GroupId, f64> =
            self.groups.iter().map(|g| (g.id, 0.0)).collect();
        for t in &self.tasks {
            *total.entry(t.group).or_default() += t.weight as f64;
        }
        for g in &self.groups {
            if let Some(parent) = g.parent {
                *total.entry(parent).or_default() += g.shares as f64;
            }
        }

        let mut hw = HWeights::default();
        for g in &self.groups {
            let h = match g.parent {
                None => ROOT_H_WEIGHT,
                Some(parent) => {
                    let (ph, pload) = hw.groups.get(&parent).copied().unwrap_or((0.0, 0.0));
                    g.shares as f64 * ph / pload
                }
            };
            hw.groups.insert(g.id, (h, total.get(&g.id).copied().unwrap_or(0.0)));
        }
        hw.tasks = self
            .tasks
            .iter()
            .map(|t| {
                let (gh, gload) = hw.groups.get(&t.group).copied().unwrap_or((0.0, 0.0));
                t.weight as f64 * gh / gload
            })
            .collect();
        hw
    }

    /// Per-CPU loads of a greedy placement, ascending. Most constrained
    /// and heaviest tasks go first, each on the least loaded CPU it may
    /// use. Tasks with no allowed online CPU are left out.
    pub fn greedy_balance(&self, hw: &HWeights) -> Vec<f64> {
        let mut order: Vec<usize> = (0..self.tasks.len()).collect();
        order.sort_by(|a, b| {
            let (ta, tb) = (&self.tasks[*a], &self.tasks[*b]);
            ta.cpus_allowed
                .weight()
                .cmp(&tb.cpus_allowed.weight())
                .then_with(|| hw.tasks[*b].total_cmp(&hw.tasks[*a]))
        });

        let mut cpus: Vec<(CpuId, f64)> = self.cpus.iter().map(|c| (*c, 0.0)).collect();
        for i in order {
            let allowed = &self.tasks[i].cpus_allowed;
            let Some(mut j) = cpus.iter().position(|(c, _)| allowed.test(*c)) else {
                continue;
            };
            cpus[j].1 += hw.tasks[i];
            while j + 1 < cpus.len() && cpus[j].1 > cpus[j + 1].1 {
                cpus.swap(j, j + 1);
                j += 1;
            }
        }
        cpus.into_iter().map(|(_, load)| load).collect()
    }

    /// Per-CPU loads of the scheduler's placement, ascending.
    pub fn actual_balance(&self, hw: &HWeights) -> Vec<f64> {
        let mut loads: BTreeMap<CpuId, f64> = self.cpus.iter().map(|c| (*c, 0.0)).collect();
        for (t, h) in self.tasks.iter().zip(&hw.tasks) {
            if let Some(load) = loads.get_mut(&t.cpu) {
                *load += h;
            }
        }
        let mut loads: Vec<f64> = loads.into_values().collect();
        loads.sort_by(f64::total_cmp);
        loads
    }

    /// Sum of squared per-rank differences between greedy and actual
    /// loads. NaN when the actual spread is tighter than the greedy one,
    /// which makes the greedy reference meaningless.
    pub fn imbalance(&self) -> f64 {
        if self.cpus.is_empty() {
            return 0.0;
        }
        let hw = self.h_weights();
        let greedy = self.greedy_balance(&hw);
        let actual = self.actual_balance(&hw);
        let n = self.cpus.len() - 1;
        if actual[n] - actual[0] < greedy[n] - greedy[0] {
            return f64::NAN;
        }
        greedy
            .iter()
            .zip(&actual)
            .map(|(g, a)| (g - a) * (g - a))
            .sum()
    }
}

/// Outcome of one scoring step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LbSample {
    /// First call: the integral starts here.
    Started,
    /// Greedy placement is worse than the actual one.
    NotComputable,
    Imbalance(f64),
}

/// Time-weighted integral of the imbalance.
#[derive(Debug, Clone)]
pub struct LbTracker {
    start: TimeNs,
    last: TimeNs,
    total: f64,
    cache: Vec<Option<(u64, f64)>>,
}

impl Default for LbTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LbTracker {
    pub fn new() -> Self {
        LbTracker {
            start: 0,
            last: 0,
            total: 0.0,
            cache: vec![None; HASH_TABLE_SIZE],
        }
    }

    /// Score the state at `now`. The imbalance holds from the previous
    /// call until this one.
    pub fn update(&mut self, now: TimeNs, state: impl FnOnce() -> LbState) -> LbSample {
        let old = self.last;
        self.last = now;
        if self.start == 0 {
            self.start = now;
            return LbSample::Started;
        }

        let state = state();
        let key = state.hash();
        let bucket = &mut self.cache[(key % HASH_TABLE_SIZE as u64) as usize];
        let imbalance = match *bucket {
            Some((k, v)) if k == key => v,
            _ => {
                let v = state.imbalance();
                *bucket = Some((key, v));
                v
            }
        };
        if imbalance.is_nan() {
            return LbSample::NotComputable;
        }
        self.total += imbalance * now.saturating_sub(old) as f64;
        LbSample::Imbalance(imbalance)
    }

    /// Average imbalance since scoring started, if any time has passed.
    pub fn average(&self, now: TimeNs) -> Option<f64> {
        if self.start == 0 || now <= self.start {
            return None;
        }
        Some(self.total / (now - self.start) as f64)
    }
}

impl<S: Scheduler> Simulator<S> {
    /// Collect the queued fair tasks and the groups above them.
    pub fn lb_state(&self) -> LbState {
        let mut tasks = Vec::new();
        for t in &self.tasks {
            let info = self.sched.task_info(t.id);
            if !info.on_rq || matches!(info.policy, SchedPolicy::Fifo { .. } | SchedPolicy::Rr { .. }) {
                continue;
            }
            tasks.push(LbTask {
                id: t.id,
                cpu: info.cpu,
                weight: info.weight,
                group: info.group,
                cfs_rq: info.cfs_rq,
                cpus_allowed: self.sched.cpus_allowed(t.id).clone(),
            });
        }
        let groups = self
            .groups
            .iter()
            .filter(|g| {
                g.parent.is_none()
                    || tasks
                        .iter()
                        .any(|t| self.groups.is_descendant(t.group, g.id))
            })
            .map(|g| LbGroup {
                id: g.id,
                parent: g.parent,
                shares: g.shares,
            })
            .collect();
        LbState {
            tasks,
            groups,
            cpus: self.ctx.online_cpus().collect(),
        }
    }

    /// Score the current placement, once per fired batch.
    pub(crate) fn compute_lb_info(&mut self) {
        let now = self.ctx.now();
        let mut lb = std::mem::take(&mut self.lb);
        let sample = lb.update(now, || self.lb_state());
        self.lb = lb;
        match sample {
            LbSample::Started => {}
            LbSample::NotComputable => {
                self.emit(format_args!(
                    "actual balance is better than greedy balance at {now}\n"
                ));
            }
            LbSample::Imbalance(imb) => {
                trace!(imbalance = imb, "lb score");
                if self.options.dump_imbalance {
                    self.emit(format_args!("imbalance at {now}: {imb:.6}\n"));
                }
                if self.options.dump_full_balance {
                    let mut buf = Vec::new();
                    self.dump_lb_info(&mut buf);
                    self.emit(format_args!("{}", String::from_utf8_lossy(&buf)));
                }
            }
        }
    }

    pub fn average_imbalance(&self) -> Option<f64> {
        self.lb.average(self.ctx.now())
    }

    /// Full placement dump: every task, every group with its per-CPU load,
    /// and every online CPU's fair queue.
    pub fn dump_lb_info(&self, w: &mut dyn Write) {
        let _ = self.write_lb_info(w);
    }

    fn write_lb_info(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "at {}", self.ctx.now())?;
        for t in &self.tasks {
            let info = self.sched.task_info(t.id);
            writeln!(
                w,
                "task {} in {} w {} cpu {} mask {} on_rq {}",
                t.id.0,
                self.groups.path(info.group),
                info.weight,
                info.cpu,
                self.sched.cpus_allowed(t.id),
                info.on_rq as u8
            )?;
        }
        for g in self.groups.iter() {
            write!(w, "group {} w {}", self.groups.path(g.id), g.shares)?;
            if g.parent.is_some() {
                write!(w, " percpu:")?;
                for cpu in self.ctx.online_cpus() {
                    write!(w, " {}", self.sched.group_load(g.id, cpu))?;
                }
            }
            writeln!(w)?;
        }
        for cpu in self.ctx.online_cpus() {
            let snap = self.sched.rq_snapshot(cpu);
            write!(
                w,
                "cpu {} {}/{} entities:",
                cpu, snap.cfs.load_weight, snap.cfs.nr_running
            )?;
            if let Some(curr) = &snap.cfs.curr {
                write!(w, " {}", curr.weight)?;
            }
            for se in &snap.cfs.timeline {
                write!(w, " {}", se.weight)?;
            }
            writeln!(w)?;
        }
        writeln!(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u32, cpu: u32, weight: u64, group: GroupId, mask: CpuMask) -> LbTask {
        LbTask {
            id: TaskId(id),
            cpu: CpuId(cpu),
            weight,
            group,
            cfs_rq: CfsRqId {
                cpu: CpuId(cpu),
                group: GroupId::ROOT,
            },
            cpus_allowed: mask,
        }
    }

    fn root() -> LbGroup {
        LbGroup {
            id: GroupId::ROOT,
            parent: None,
            shares: 1024,
        }
    }

    fn cpus(n: u32) -> Vec<CpuId> {
        (0..n).map(CpuId).collect()
    }

    #[test]
    fn test_h_weights_split_down_from_root() {
        let g1 = GroupId(1);
        let g2 = GroupId(2);
        let state = LbState {
            tasks: vec![
                task(1, 0, 1024, GroupId::ROOT, CpuMask::all()),
                task(2, 0, 1024, g1, CpuMask::all()),
                task(3, 1, 2048, g1, CpuMask::all()),
                task(4, 1, 1024, g2, CpuMask::all()),
            ],
            groups: vec![
                root(),
                LbGroup {
                    id: g1,
                    parent: Some(GroupId::ROOT),
                    shares: 2048,
                },
                LbGroup {
                    id: g2,
                    parent: Some(g1),
                    shares: 1024,
                },
            ],
            cpus: cpus(2),
        };
        let hw = state.h_weights();
        let (root_h, _) = hw.groups[&GroupId::ROOT];
        let (g1_h, _) = hw.groups[&g1];
        let (g2_h, _) = hw.groups[&g2];
        assert_eq!(root_h, ROOT_H_WEIGHT);
        assert!((hw.tasks[0] + g1_h - root_h).abs() < 1e-9);
        assert!((hw.tasks[1] + hw.tasks[2] + g2_h - g1_h).abs() < 1e-9);
        assert!((hw.tasks[3] - g2_h).abs() < 1e-9);
        let total: f64 = hw.tasks.iter().sum();
        assert!((total - ROOT_H_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_h_weights_through_task_less_group() {
        // root -> mid (no tasks of its own) -> {a, b}
        let (mid, a, b) = (GroupId(1), GroupId(2), GroupId(3));
        let child = |id, parent, shares| LbGroup {
            id,
            parent: Some(parent),
            shares,
        };
        let state = LbState {
            tasks: vec![
                task(1, 0, 1024, GroupId::ROOT, CpuMask::all()),
                task(2, 1, 1024, a, CpuMask::all()),
                task(3, 1, 1024, b, CpuMask::all()),
                task(4, 0, 3072, b, CpuMask::all()),
            ],
            groups: vec![root(), child(mid, GroupId::ROOT, 1024), child(a, mid, 1024), child(b, mid, 3072)],
            cpus: cpus(2),
        };
        let hw = state.h_weights();
        assert_eq!(hw.groups[&mid], (512.0, 4096.0));
        assert_eq!(hw.tasks, vec![512.0, 128.0, 96.0, 288.0]);
        let total: f64 = hw.tasks.iter().sum();
        assert!((total - ROOT_H_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_greedy_respects_affinity_and_sorts() {
        let state = LbState {
            tasks: vec![
                task(1, 0, 1024, GroupId::ROOT, CpuMask::all()),
                task(2, 0, 1024, GroupId::ROOT, CpuMask::from_cpu(CpuId(0))),
                task(3, 0, 1024, GroupId::ROOT, CpuMask::from_cpu(CpuId(0))),
            ],
            groups: vec![root()],
            cpus: cpus(2),
        };
        let hw = state.h_weights();
        let greedy = state.greedy_balance(&hw);
        let third = ROOT_H_WEIGHT / 3.0;
        assert!((greedy[0] - third).abs() < 1e-9);
        assert!((greedy[1] - 2.0 * third).abs() < 1e-9);
        let actual = state.actual_balance(&hw);
        assert_eq!(actual[0], 0.0);
        assert!((state.imbalance() - 2.0 * third * third).abs() < 1e-6);
    }

    #[test]
    fn test_better_than_greedy_is_not_computable() {
        // Greedy ends at 3+2+2 | 3+2 while 3+3 | 2+2+2 is perfectly even.
        let w = [3072, 3072, 2048, 2048, 2048];
        let placement = [0, 0, 1, 1, 1];
        let state = LbState {
            tasks: (0..5)
                .map(|i| task(i as u32 + 1, placement[i], w[i], GroupId::ROOT, CpuMask::all()))
                .collect(),
            groups: vec![root()],
            cpus: cpus(2),
        };
        assert!(state.imbalance().is_nan());
    }

    #[test]
    fn test_tracker_integrates_and_caches() {
        let state = LbState {
            tasks: vec![
                task(1, 0, 1024, GroupId::ROOT, CpuMask::all()),
                task(2, 0, 1024, GroupId::ROOT, CpuMask::all()),
            ],
            groups: vec![root()],
            cpus: cpus(2),
        };
        let expected = 2.0 * 512.0 * 512.0;
        let mut lb = LbTracker::new();
        assert_eq!(lb.update(1_000, || state.clone()), LbSample::Started);
        assert_eq!(lb.update(3_000, || state.clone()), LbSample::Imbalance(expected));
        // Same hash: served from the cache.
        assert_eq!(lb.update(4_000, || state.clone()), LbSample::Imbalance(expected));
        assert_eq!(lb.average(4_000), Some(expected));
        assert_eq!(LbTracker::new().average(10), None);
    }

    #[test]
    fn test_hash_sees_affinity() {
        let a = LbState {
            tasks: vec![task(1, 0, 1024, GroupId::ROOT, CpuMask::all())],
            groups: vec![root()],
            cpus: cpus(2),
        };
        let mut b = a.clone();
        b.tasks[0].cpus_allowed = CpuMask::from_cpu(CpuId(0));
        assert_ne!(a.hash(), b.hash());
    }
}
