//! Load balancing for the reference scheduler: periodic balancing from the
//! rebalance softirq, newly-idle balancing from `schedule()`, balancing on
//! behalf of tickless idle CPUs and active balancing through stop work.

use std::cmp::Reverse;

use tracing::{debug, trace};

use super::reference::{Class, RefScheduler};
use super::{Scheduler, StopWork};
use crate::clock::HZ;
use crate::context::SimulationContext;
use crate::irq::SoftIrq;
use crate::topology::SchedDomain;
use crate::types::{CpuId, TaskId};

/// Failed attempts before the running task is pushed off the busiest CPU.
const CACHE_NICE_TRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IdleType {
    Busy,
    Idle,
    NewlyIdle,
}

impl RefScheduler {
    /// Called from the tick: raise the rebalance softirq when balancing is
    /// due and kick a tickless idle CPU if this one is overloaded.
    pub(super) fn trigger_load_balance(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        let jiffies = ctx.jiffies();
        if jiffies >= self.rq(cpu).next_balance {
            ctx.raise_softirq(cpu, SoftIrq::Sched);
        }

        if self.rq(cpu).nr_running < 2 || jiffies < self.nohz_next_kick {
            return;
        }
        let Some(top) = ctx.sched_domains(cpu).last() else {
            return;
        };
        let Some(ilb) = ctx.nohz_idle_mask().first_and(&top.span) else {
            return;
        };
        trace!(cpu = cpu.0, ilb = ilb.0, "nohz kick");
        self.rq_mut(ilb).nohz_kick = true;
        ctx.raise_softirq(ilb, SoftIrq::Sched);
        self.nohz_next_kick = jiffies + 1;
    }

    pub(super) fn run_rebalance_domains(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        let idle = if self.idle_cpu(cpu) {
            IdleType::Idle
        } else {
            IdleType::Busy
        };
        self.rebalance_domains(ctx, cpu, idle);

        if !std::mem::take(&mut self.rq_mut(cpu).nohz_kick) {
            return;
        }
        let Some(top) = ctx.sched_domains(cpu).last() else {
            return;
        };
        let idle_cpus = ctx.nohz_idle_mask().and(&top.span);
        for other in idle_cpus.iter().filter(|c| *c != cpu) {
            if self.idle_cpu(other) {
                self.rebalance_domains(ctx, other, IdleType::Idle);
            }
        }
    }

    fn rebalance_domains(&mut self, ctx: &mut SimulationContext, cpu: CpuId, idle: IdleType) {
        let jiffies = ctx.jiffies();
        let domains: Vec<SchedDomain> = ctx.sched_domains(cpu).to_vec();
        let mut next_balance = jiffies + HZ;
        for (level, sd) in domains.iter().enumerate() {
            let mut interval = sd.balance_interval.max(1);
            if idle != IdleType::Idle {
                interval *= sd.level.busy_factor();
            }
            if jiffies >= self.rq(cpu).last_balance[level] + interval {
                self.load_balance(ctx, cpu, level, sd, idle);
                self.rq_mut(cpu).last_balance[level] = jiffies;
            }
            next_balance = next_balance.min(self.rq(cpu).last_balance[level] + interval);
        }
        self.rq_mut(cpu).next_balance = next_balance;
    }

    /// Pull fair tasks from the most loaded CPU in `sd` to `this`. Returns
    /// whether anything moved.
    fn load_balance(
        &mut self,
        ctx: &mut SimulationContext,
        this: CpuId,
        level: usize,
        sd: &SchedDomain,
        idle: IdleType,
    ) -> bool {
        self.rq_mut(this).dom_stat[level].lb_count += 1;

        let busiest = sd
            .span
            .iter()
            .filter(|c| *c != this && ctx.cpu_online(*c))
            .max_by_key(|c| (self.rq(*c).load(), Reverse(c.0)));
        let Some(busiest) = busiest else {
            self.rq_mut(this).dom_stat[level].lb_nobusyq += 1;
            return false;
        };
        if self.rq(busiest).load() <= self.rq(this).load() {
            let rq = self.rq_mut(this);
            rq.dom_stat[level].lb_balanced += 1;
            rq.balance_failed[level] = 0;
            return false;
        }

        let candidates: Vec<TaskId> = self
            .rq(busiest)
            .cfs
            .iter()
            .rev()
            .map(|(_, id)| id)
            .filter(|id| self.task(*id).cpus_allowed.test(this))
            .collect();
        let mut moved = 0;
        for id in candidates {
            let weight = self.task(id).weight;
            let (busy_load, this_load) = (self.rq(busiest).load(), self.rq(this).load());
            if busy_load <= this_load || busy_load - this_load <= weight {
                continue;
            }
            self.move_queued_task(ctx, id, this);
            moved += 1;
            if idle == IdleType::NewlyIdle {
                break;
            }
        }

        if moved > 0 {
            let rq = self.rq_mut(this);
            rq.dom_stat[level].lb_gained += moved;
            rq.balance_failed[level] = 0;
            debug!(
                cpu = rq.cpu.0,
                busiest = busiest.0,
                level = sd.name(),
                moved,
                "load balance"
            );
            return true;
        }

        let failed = {
            let rq = self.rq_mut(this);
            rq.dom_stat[level].lb_failed += 1;
            rq.balance_failed[level] += 1;
            rq.balance_failed[level]
        };
        if failed > CACHE_NICE_TRIES && self.should_active_balance(ctx, this, busiest) {
            ctx.queue_stop_work(busiest, StopWork::ActiveBalance { target: this });
            let rq = self.rq_mut(this);
            rq.dom_stat[level].alb_count += 1;
            rq.balance_failed[level] = 0;
            debug!(cpu = this.0, busiest = busiest.0, "active balance queued");
        }
        false
    }

    fn should_active_balance(&self, ctx: &SimulationContext, this: CpuId, busiest: CpuId) -> bool {
        if ctx.stop_work_pending(busiest) {
            return false;
        }
        let Some(curr) = self.rq(busiest).curr else {
            return false;
        };
        let t = self.task(curr);
        if t.class() != Class::Fair || !t.cpus_allowed.test(this) {
            return false;
        }
        let (busy_load, this_load) = (self.rq(busiest).load(), self.rq(this).load());
        busy_load > this_load && busy_load - this_load > t.weight
    }

    /// Balance a CPU that is about to go idle, lowest domain first, until
    /// one task has been pulled.
    pub(super) fn idle_balance(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        let domains: Vec<SchedDomain> = ctx.sched_domains(cpu).to_vec();
        for (level, sd) in domains.iter().enumerate() {
            self.rq_mut(cpu).dom_stat[level].idle_lb_count += 1;
            if self.load_balance(ctx, cpu, level, sd, IdleType::NewlyIdle) {
                break;
            }
        }
    }

    /// Stop work on a busy CPU: push one queued fair task to `target`.
    pub(super) fn active_load_balance(&mut self, ctx: &mut SimulationContext, cpu: CpuId, target: CpuId) {
        if !ctx.cpu_online(target) || target == cpu {
            return;
        }
        let candidate = self
            .rq(cpu)
            .cfs
            .iter()
            .map(|(_, id)| id)
            .find(|id| self.task(*id).cpus_allowed.test(target) && !self.is_running(*id));
        let Some(id) = candidate else {
            return;
        };
        self.move_queued_task(ctx, id, target);
        let level = ctx
            .sched_domains(target)
            .iter()
            .position(|sd| sd.span.test(cpu))
            .unwrap_or(0);
        self.rq_mut(target).dom_stat[level].alb_pushed += 1;
        debug!(task = id.0, from = cpu.0, to = target.0, "active balance pushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{SchedPolicy, TaskState};
    use crate::topology::{Topology, TopologyKind};

    fn setup(kind: TopologyKind) -> (SimulationContext, RefScheduler) {
        let mut ctx = SimulationContext::new(Topology::canned(kind));
        let mut sched = RefScheduler::new();
        sched.init(&mut ctx);
        (ctx, sched)
    }

    #[test]
    fn test_load_balance_pulls_queued_task() {
        let (mut ctx, mut sched) = setup(TopologyKind::DualCpu);
        let only0 = crate::cpumask::CpuMask::from_cpu(CpuId(0));
        for id in 1..=3 {
            sched.fork(&mut ctx, TaskId(id), SchedPolicy::Normal { nice: 0 });
            sched.set_cpus_allowed(&mut ctx, TaskId(id), &only0);
        }
        sched.schedule(&mut ctx);
        assert_eq!(sched.nr_running(CpuId(0)), 3);
        for id in 1..=3 {
            let mask = crate::cpumask::CpuMask::first_n(2);
            sched.set_cpus_allowed(&mut ctx, TaskId(id), &mask);
        }

        ctx.change_cpu(CpuId(1));
        sched.schedule(&mut ctx);
        assert_eq!(sched.nr_running(CpuId(1)), 1);
        assert_eq!(sched.nr_running(CpuId(0)), 2);
        assert!(sched.curr(CpuId(1)).is_some());
        assert_eq!(sched.domain_schedstat(CpuId(1), 0).idle_lb_count, 1);
        assert_eq!(sched.domain_schedstat(CpuId(1), 0).lb_gained, 1);
    }

    #[test]
    fn test_balanced_pair_does_not_move() {
        let (mut ctx, mut sched) = setup(TopologyKind::DualCpu);
        sched.fork(&mut ctx, TaskId(1), SchedPolicy::Normal { nice: 0 });
        sched.fork(&mut ctx, TaskId(2), SchedPolicy::Normal { nice: 0 });
        assert_eq!(sched.task_info(TaskId(1)).cpu, CpuId(0));
        assert_eq!(sched.task_info(TaskId(2)).cpu, CpuId(1));
        sched.set_state(TaskId(2), TaskState::Interruptible);
        sched.dequeue_sleeping(&mut ctx, TaskId(2), TaskState::Interruptible);

        ctx.change_cpu(CpuId(1));
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(1)), None);
        assert_eq!(sched.nr_running(CpuId(0)), 1);
        assert_eq!(sched.domain_schedstat(CpuId(1), 0).lb_failed, 1);
    }
}
