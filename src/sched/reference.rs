//! Reference scheduler: per-CPU run queues with stop, real-time and fair
//! classes, picked in that order.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::fair::{calc_delta_fair, wakeup_preempt, CfsRq, TimelineKey, SCHED_MIN_GRANULARITY_NS};
use super::rt::{prio_index, RtRq, RR_TIMESLICE_NS};
use super::{
    CfsRqId, CfsRqSnapshot, CpuSchedStat, DomainSchedStat, EntityKey, EntityKind, EntitySnapshot,
    RqSnapshot, SchedPolicy, Scheduler, StopWork, TaskInfo, TaskState,
};
use crate::clock::TICK_NS;
use crate::context::SimulationContext;
use crate::cpumask::CpuMask;
use crate::topology::MAX_DOMAINS;
use crate::types::{CpuId, GroupId, TaskId, TimeNs, Vruntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Class {
    Fair,
    Rt,
    Stop,
}

/// How a task arrives on a run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Enqueue {
    /// Freshly forked; vruntime already placed on the target queue.
    New,
    Wakeup,
    /// Moved from another queue; vruntime is relative.
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dequeue {
    Sleep,
    /// Leaving for another queue; vruntime becomes relative.
    Migrate,
}

/// Per-task scheduler state.
#[derive(Debug)]
pub(super) struct SchedTask {
    pub(super) id: TaskId,
    pub(super) policy: SchedPolicy,
    pub(super) state: TaskState,
    pub(super) on_rq: bool,
    pub(super) cpu: CpuId,
    pub(super) cpus_allowed: CpuMask,
    pub(super) weight: u64,
    pub(super) group: GroupId,
    pub(super) vruntime: Vruntime,
    pub(super) timeline_key: Option<TimelineKey>,
    pub(super) exec_start: TimeNs,
    pub(super) sum_exec_runtime: TimeNs,
    pub(super) prev_sum_exec_runtime: TimeNs,
    /// Set while runnable and waiting for a CPU.
    pub(super) last_queued: Option<TimeNs>,
    pub(super) run_delay: TimeNs,
    pub(super) pcount: u64,
    pub(super) rt_time_slice: TimeNs,
    pub(super) is_stop: bool,
}

impl SchedTask {
    pub(super) fn class(&self) -> Class {
        if self.is_stop {
            Class::Stop
        } else if self.policy.is_rt() {
            Class::Rt
        } else {
            Class::Fair
        }
    }

    fn rt_index(&self) -> usize {
        match self.policy {
            SchedPolicy::Fifo { prio } | SchedPolicy::Rr { prio } => prio_index(prio),
            _ => unreachable!("rt index of a non-rt task"),
        }
    }
}

/// Per-CPU run queue.
#[derive(Debug)]
pub(super) struct Rq {
    pub(super) cpu: CpuId,
    pub(super) curr: Option<TaskId>,
    pub(super) need_resched: bool,
    pub(super) nr_running: usize,
    pub(super) stop: Option<TaskId>,
    pub(super) stop_queued: bool,
    pub(super) rt: RtRq,
    pub(super) cfs: CfsRq,
    /// Jiffy at which periodic balancing is next due.
    pub(super) next_balance: u64,
    pub(super) last_balance: [u64; MAX_DOMAINS],
    pub(super) balance_failed: [u32; MAX_DOMAINS],
    /// Balance on behalf of tickless idle CPUs at the next rebalance.
    pub(super) nohz_kick: bool,
    pub(super) stat: CpuSchedStat,
    pub(super) dom_stat: [DomainSchedStat; MAX_DOMAINS],
}

impl Rq {
    fn new(cpu: CpuId) -> Self {
        Rq {
            cpu,
            curr: None,
            need_resched: false,
            nr_running: 0,
            stop: None,
            stop_queued: false,
            rt: RtRq::default(),
            cfs: CfsRq::default(),
            next_balance: 0,
            last_balance: [0; MAX_DOMAINS],
            balance_failed: [0; MAX_DOMAINS],
            nohz_kick: false,
            stat: CpuSchedStat::default(),
            dom_stat: [DomainSchedStat::default(); MAX_DOMAINS],
        }
    }

    /// Load used for placement and balancing.
    pub(super) fn load(&self) -> u64 {
        self.cfs.load_weight
    }
}

/// The bundled reference scheduler.
pub struct RefScheduler {
    pub(super) rqs: Vec<Rq>,
    pub(super) tasks: BTreeMap<TaskId, SchedTask>,
    /// Earliest jiffy at which another nohz kick may be sent.
    pub(super) nohz_next_kick: u64,
}

impl Default for RefScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RefScheduler {
    pub fn new() -> Self {
        RefScheduler {
            rqs: Vec::new(),
            tasks: BTreeMap::new(),
            nohz_next_kick: 0,
        }
    }

    pub(super) fn task(&self, id: TaskId) -> &SchedTask {
        match self.tasks.get(&id) {
            Some(t) => t,
            None => panic!("unknown task {id}"),
        }
    }

    pub(super) fn task_mut(&mut self, id: TaskId) -> &mut SchedTask {
        match self.tasks.get_mut(&id) {
            Some(t) => t,
            None => panic!("unknown task {id}"),
        }
    }

    pub(super) fn rq(&self, cpu: CpuId) -> &Rq {
        &self.rqs[cpu.index()]
    }

    pub(super) fn rq_mut(&mut self, cpu: CpuId) -> &mut Rq {
        &mut self.rqs[cpu.index()]
    }

    pub(super) fn is_running(&self, id: TaskId) -> bool {
        let cpu = self.task(id).cpu;
        self.rq(cpu).curr == Some(id)
    }

    /// Charge the running task of `cpu` for time since it was last
    /// accounted.
    pub(super) fn update_curr(&mut self, ctx: &SimulationContext, cpu: CpuId) {
        let now = ctx.now();
        let Some(curr) = self.rq(cpu).curr else {
            return;
        };
        let t = self.task_mut(curr);
        let delta = now.saturating_sub(t.exec_start);
        if delta == 0 {
            return;
        }
        t.exec_start = now;
        t.sum_exec_runtime += delta;
        let fair = t.class() == Class::Fair;
        let vruntime = if fair {
            t.vruntime = Vruntime(t.vruntime.0.wrapping_add(calc_delta_fair(delta, t.weight)));
            Some(t.vruntime)
        } else {
            None
        };
        let rq = self.rq_mut(cpu);
        rq.stat.rq_cpu_time += delta;
        if fair {
            rq.cfs.update_min_vruntime(vruntime);
        }
    }

    fn curr_fair_vruntime(&self, cpu: CpuId) -> Option<Vruntime> {
        let curr = self.rq(cpu).cfs.curr?;
        Some(self.task(curr).vruntime)
    }

    pub(super) fn enqueue_task(
        &mut self,
        ctx: &SimulationContext,
        id: TaskId,
        cpu: CpuId,
        how: Enqueue,
    ) {
        let now = ctx.now();
        let class = self.task(id).class();
        if class == Class::Fair {
            self.update_curr(ctx, cpu);
        }
        let min_vruntime = self.rq(cpu).cfs.min_vruntime;
        let t = self.task_mut(id);
        assert!(!t.on_rq, "task {id} enqueued twice");
        t.cpu = cpu;
        t.on_rq = true;
        if t.last_queued.is_none() {
            t.last_queued = Some(now);
        }
        let (weight, vruntime) = (t.weight, t.vruntime);
        match class {
            Class::Stop => self.rq_mut(cpu).stop_queued = true,
            Class::Rt => {
                let idx = self.task(id).rt_index();
                self.rq_mut(cpu).rt.enqueue(idx, id, false);
            }
            Class::Fair => {
                let vruntime = match how {
                    Enqueue::New => vruntime,
                    Enqueue::Migrate => Vruntime(vruntime.0.wrapping_add(min_vruntime)),
                    Enqueue::Wakeup => self.rq(cpu).cfs.place_entity(vruntime, weight, false),
                };
                let curr_v = self.curr_fair_vruntime(cpu);
                let rq = self.rq_mut(cpu);
                let key = rq.cfs.insert(id, vruntime);
                rq.cfs.account_enqueue(weight);
                rq.cfs.update_min_vruntime(curr_v);
                let t = self.task_mut(id);
                t.vruntime = vruntime;
                t.timeline_key = Some(key);
            }
        }
        self.rq_mut(cpu).nr_running += 1;
        trace!(task = id.0, cpu = cpu.0, ?how, "enqueue");
    }

    pub(super) fn dequeue_task(&mut self, ctx: &SimulationContext, id: TaskId, how: Dequeue) {
        let now = ctx.now();
        let cpu = self.task(id).cpu;
        let class = self.task(id).class();
        if class == Class::Fair {
            self.update_curr(ctx, cpu);
        }
        let t = self.task_mut(id);
        assert!(t.on_rq, "task {id} dequeued while not queued");
        t.on_rq = false;
        if let Some(queued) = t.last_queued.take() {
            t.run_delay += now.saturating_sub(queued);
        }
        let weight = t.weight;
        let key = t.timeline_key.take();
        match class {
            Class::Stop => self.rq_mut(cpu).stop_queued = false,
            Class::Rt => {
                let idx = self.task(id).rt_index();
                self.rq_mut(cpu).rt.dequeue(idx, id);
            }
            Class::Fair => {
                let rq = self.rq_mut(cpu);
                if let Some(key) = key {
                    rq.cfs.remove(key);
                }
                rq.cfs.account_dequeue(weight);
                let min_vruntime = rq.cfs.min_vruntime;
                if how == Dequeue::Migrate {
                    let t = self.task_mut(id);
                    t.vruntime = Vruntime(t.vruntime.0.wrapping_sub(min_vruntime));
                }
                let curr_v = self.curr_fair_vruntime(cpu).filter(|_| self.rq(cpu).cfs.curr != Some(id));
                self.rq_mut(cpu).cfs.update_min_vruntime(curr_v);
            }
        }
        self.rq_mut(cpu).nr_running -= 1;
        trace!(task = id.0, cpu = cpu.0, ?how, "dequeue");
    }

    /// Move a queued, not running task to `dest`.
    pub(super) fn move_queued_task(&mut self, ctx: &mut SimulationContext, id: TaskId, dest: CpuId) {
        assert!(!self.is_running(id), "moving running task {id}");
        let src = self.task(id).cpu;
        if src == dest {
            return;
        }
        self.dequeue_task(ctx, id, Dequeue::Migrate);
        self.enqueue_task(ctx, id, dest, Enqueue::Migrate);
        debug!(task = id.0, from = src.0, to = dest.0, "migrate");
        self.check_preempt_curr(ctx, dest, id);
    }

    /// Flag `cpu` for rescheduling, interrupting it if it is remote.
    pub(super) fn resched_curr(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        let rq = self.rq_mut(cpu);
        if rq.need_resched {
            return;
        }
        rq.need_resched = true;
        ctx.send_reschedule(cpu);
    }

    /// Preempt the running task of `cpu` if `woken` should run first.
    pub(super) fn check_preempt_curr(&mut self, ctx: &mut SimulationContext, cpu: CpuId, woken: TaskId) {
        let Some(curr) = self.rq(cpu).curr else {
            self.resched_curr(ctx, cpu);
            return;
        };
        let (wc, cc) = (self.task(woken).class(), self.task(curr).class());
        let preempt = match wc.cmp(&cc) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match wc {
                Class::Stop => false,
                Class::Rt => self.task(woken).rt_index() < self.task(curr).rt_index(),
                Class::Fair => {
                    if matches!(self.task(woken).policy, SchedPolicy::Batch { .. }) {
                        false
                    } else {
                        self.update_curr(ctx, cpu);
                        let w = self.task(woken);
                        wakeup_preempt(self.task(curr).vruntime, w.vruntime, w.weight)
                    }
                }
            },
        };
        if preempt {
            self.resched_curr(ctx, cpu);
        }
    }

    /// First allowed online CPU, breaking affinity if none is left.
    pub(super) fn fallback_cpu(&self, ctx: &SimulationContext, id: TaskId) -> CpuId {
        let online = ctx.online_mask();
        let t = self.task(id);
        if let Some(cpu) = t.cpus_allowed.first_and(&online) {
            return cpu;
        }
        warn!(task = id.0, "no allowed cpu online, breaking affinity");
        online.first().unwrap_or(t.cpu)
    }

    fn pick_next_task(&self, cpu: CpuId) -> Option<TaskId> {
        let rq = self.rq(cpu);
        if rq.stop_queued {
            return rq.stop;
        }
        if let Some(id) = rq.rt.pick() {
            return Some(id);
        }
        rq.cfs.leftmost().map(|(_, id)| id)
    }

    /// Take `prev` off the CPU. A still-runnable fair task goes back on
    /// the timeline.
    fn put_prev_task(&mut self, prev: TaskId) {
        let t = self.task(prev);
        let cpu = t.cpu;
        if t.class() != Class::Fair {
            return;
        }
        let (on_rq, vruntime) = (t.on_rq, t.vruntime);
        let rq = self.rq_mut(cpu);
        rq.cfs.curr = None;
        if on_rq {
            let key = rq.cfs.insert(prev, vruntime);
            self.task_mut(prev).timeline_key = Some(key);
        }
    }

    fn set_next_task(&mut self, now: TimeNs, next: TaskId) {
        let t = self.task_mut(next);
        t.exec_start = now;
        t.prev_sum_exec_runtime = t.sum_exec_runtime;
        let cpu = t.cpu;
        if t.class() == Class::Fair {
            let key = t.timeline_key.take();
            let rq = self.rq_mut(cpu);
            if let Some(key) = key {
                rq.cfs.remove(key);
            }
            rq.cfs.curr = Some(next);
        }
    }

    /// Hand the CPU from `prev` to `next`, updating wait statistics.
    fn switch_to(&mut self, now: TimeNs, cpu: CpuId, prev: Option<TaskId>, next: Option<TaskId>) {
        if prev == next {
            return;
        }
        if let Some(p) = prev {
            let t = self.task_mut(p);
            if t.on_rq && t.last_queued.is_none() {
                t.last_queued = Some(now);
            }
        }
        if let Some(n) = next {
            let t = self.task_mut(n);
            let delay = t.last_queued.take().map_or(0, |q| now.saturating_sub(q));
            t.run_delay += delay;
            t.pcount += 1;
            let rq = self.rq_mut(cpu);
            rq.stat.run_delay += delay;
            rq.stat.pcount += 1;
        }
        trace!(cpu = cpu.0, prev = ?prev.map(|p| p.0), next = ?next.map(|n| n.0), "switch");
    }

    fn check_preempt_tick(&mut self, ctx: &mut SimulationContext, cpu: CpuId, curr: TaskId) {
        let t = self.task(curr);
        let ideal = self.rq(cpu).cfs.sched_slice(t.weight, true);
        let delta_exec = t.sum_exec_runtime - t.prev_sum_exec_runtime;
        if delta_exec > ideal {
            self.resched_curr(ctx, cpu);
            return;
        }
        if delta_exec < SCHED_MIN_GRANULARITY_NS {
            return;
        }
        if let Some(((left, _), _)) = self.rq(cpu).cfs.leftmost() {
            let delta = t.vruntime.delta(left);
            if delta > 0 && delta as u64 > ideal {
                self.resched_curr(ctx, cpu);
            }
        }
    }

    fn task_tick_rt(&mut self, ctx: &mut SimulationContext, cpu: CpuId, curr: TaskId) {
        let t = self.task_mut(curr);
        if !matches!(t.policy, SchedPolicy::Rr { .. }) {
            return;
        }
        t.rt_time_slice = t.rt_time_slice.saturating_sub(TICK_NS);
        if t.rt_time_slice > 0 {
            return;
        }
        t.rt_time_slice = RR_TIMESLICE_NS;
        let idx = t.rt_index();
        if self.rq_mut(cpu).rt.requeue(idx, curr) {
            self.resched_curr(ctx, cpu);
        }
    }

    /// CPU for a waking task: its previous CPU if idle, else an idle CPU
    /// from the lowest domain shared with it, else the previous CPU.
    pub(super) fn select_task_rq_wake(&self, ctx: &SimulationContext, id: TaskId) -> CpuId {
        let t = self.task(id);
        if t.is_stop {
            return t.cpu;
        }
        let allowed = t.cpus_allowed.and(&ctx.online_mask());
        if allowed.is_empty() {
            return self.fallback_cpu(ctx, id);
        }
        let prev = t.cpu;
        if allowed.test(prev) && self.idle_cpu(prev) {
            return prev;
        }
        for sd in ctx.sched_domains(prev) {
            if let Some(cpu) = sd.span.and(&allowed).iter().find(|c| self.idle_cpu(*c)) {
                return cpu;
            }
        }
        if allowed.test(prev) {
            prev
        } else {
            self.fallback_cpu(ctx, id)
        }
    }

    /// CPU for a new task: the least loaded allowed online CPU, lowest id
    /// on ties.
    fn select_task_rq_fork(&self, ctx: &SimulationContext, id: TaskId) -> CpuId {
        let t = self.task(id);
        let allowed = t.cpus_allowed.and(&ctx.online_mask());
        allowed
            .iter()
            .min_by_key(|c| {
                let rq = self.rq(*c);
                (rq.load() + rq.rt.nr_running as u64 * super::NICE_0_LOAD, rq.nr_running, c.0)
            })
            .unwrap_or_else(|| self.fallback_cpu(ctx, id))
    }

    fn entity_snapshot(&self, id: TaskId) -> EntitySnapshot {
        let t = self.task(id);
        EntitySnapshot {
            kind: EntityKind::Task {
                id,
                task_cpu: t.cpu,
            },
            vruntime: t.vruntime,
            weight: t.weight,
            on_rq: t.on_rq,
            cfs_rq: CfsRqId {
                cpu: t.cpu,
                group: GroupId::ROOT,
            },
        }
    }

    fn new_task(&self, id: TaskId, policy: SchedPolicy, cpu: CpuId) -> SchedTask {
        SchedTask {
            id,
            policy,
            state: TaskState::Running,
            on_rq: false,
            cpu,
            cpus_allowed: CpuMask::all(),
            weight: policy.weight(),
            group: GroupId::ROOT,
            vruntime: Vruntime(0),
            timeline_key: None,
            exec_start: 0,
            sum_exec_runtime: 0,
            prev_sum_exec_runtime: 0,
            last_queued: None,
            run_delay: 0,
            pcount: 0,
            rt_time_slice: RR_TIMESLICE_NS,
            is_stop: false,
        }
    }
}

impl Scheduler for RefScheduler {
    fn name(&self) -> &str {
        "reference"
    }

    fn init(&mut self, ctx: &mut SimulationContext) {
        self.rqs = (0..ctx.nr_cpu_ids() as u32).map(|i| Rq::new(CpuId(i))).collect();
        let jiffies = ctx.jiffies();
        for rq in &mut self.rqs {
            rq.next_balance = jiffies;
        }
    }

    fn fork(&mut self, ctx: &mut SimulationContext, task: TaskId, policy: SchedPolicy) {
        assert!(!self.tasks.contains_key(&task), "task {task} forked twice");
        let t = self.new_task(task, policy, ctx.active_cpu());
        self.tasks.insert(task, t);
        let cpu = self.select_task_rq_fork(ctx, task);
        if !policy.is_rt() {
            let weight = policy.weight();
            let v = self.rq(cpu).cfs.place_entity(Vruntime(0), weight, true);
            self.task_mut(task).vruntime = v;
        }
        self.enqueue_task(ctx, task, cpu, Enqueue::New);
        debug!(task = task.0, cpu = cpu.0, ?policy, "fork");
        self.check_preempt_curr(ctx, cpu, task);
    }

    fn set_stop_task(&mut self, _ctx: &mut SimulationContext, cpu: CpuId, task: TaskId) {
        let mut t = self.new_task(task, SchedPolicy::Fifo { prio: 99 }, cpu);
        t.is_stop = true;
        t.state = TaskState::Interruptible;
        t.cpus_allowed = CpuMask::from_cpu(cpu);
        self.tasks.insert(task, t);
        self.rq_mut(cpu).stop = Some(task);
    }

    fn set_cpus_allowed(&mut self, ctx: &mut SimulationContext, task: TaskId, mask: &CpuMask) {
        let t = self.task_mut(task);
        t.cpus_allowed = mask.clone();
        let cpu = t.cpu;
        if !t.on_rq || (mask.test(cpu) && ctx.cpu_online(cpu)) {
            return;
        }
        if self.is_running(task) {
            // Moved off when it is put back at the next schedule().
            self.resched_curr(ctx, cpu);
        } else {
            let dest = self.fallback_cpu(ctx, task);
            self.move_queued_task(ctx, task, dest);
        }
    }

    fn wake_up(&mut self, ctx: &mut SimulationContext, task: TaskId) -> bool {
        let t = self.task(task);
        if t.state == TaskState::Running {
            return false;
        }
        if t.on_rq {
            // Still on its CPU: it never really went to sleep.
            self.task_mut(task).state = TaskState::Running;
            return true;
        }
        let prev = t.cpu;
        let cpu = self.select_task_rq_wake(ctx, task);
        let active = ctx.active_cpu();
        {
            let rq = self.rq_mut(cpu);
            rq.stat.ttwu_count += 1;
            if cpu == active {
                rq.stat.ttwu_local += 1;
            }
        }
        if cpu != active {
            if let Some(level) = ctx
                .sched_domains(active)
                .iter()
                .position(|sd| sd.span.test(cpu))
            {
                self.rq_mut(active).dom_stat[level].ttwu_wake_remote += 1;
            }
        }
        if self.task(task).class() == Class::Fair && cpu != prev {
            let (from, to) = (self.rq(prev).cfs.min_vruntime, self.rq(cpu).cfs.min_vruntime);
            let t = self.task_mut(task);
            t.vruntime = Vruntime(t.vruntime.0.wrapping_sub(from).wrapping_add(to));
        }
        self.task_mut(task).state = TaskState::Running;
        self.enqueue_task(ctx, task, cpu, Enqueue::Wakeup);
        trace!(task = task.0, cpu = cpu.0, "wakeup");
        self.check_preempt_curr(ctx, cpu, task);
        true
    }

    fn set_state(&mut self, task: TaskId, state: TaskState) {
        self.task_mut(task).state = state;
    }

    fn dequeue_sleeping(&mut self, ctx: &mut SimulationContext, task: TaskId, state: TaskState) {
        assert!(!self.is_running(task), "dequeue_sleeping on running task {task}");
        self.task_mut(task).state = state;
        self.dequeue_task(ctx, task, Dequeue::Sleep);
    }

    fn schedule(&mut self, ctx: &mut SimulationContext) {
        let cpu = ctx.active_cpu();
        let now = ctx.now();
        let prev = self.rq(cpu).curr;
        self.rq_mut(cpu).stat.sched_count += 1;

        if let Some(p) = prev {
            self.update_curr(ctx, cpu);
            if self.task(p).state != TaskState::Running && self.task(p).on_rq {
                self.dequeue_task(ctx, p, Dequeue::Sleep);
            }
            self.put_prev_task(p);
            self.rq_mut(cpu).curr = None;
            let t = self.task(p);
            if t.on_rq && !t.is_stop && (!t.cpus_allowed.test(cpu) || !ctx.cpu_online(cpu)) {
                let dest = self.fallback_cpu(ctx, p);
                self.move_queued_task(ctx, p, dest);
            }
        }

        if self.rq(cpu).nr_running == 0 && ctx.cpu_online(cpu) {
            self.idle_balance(ctx, cpu);
        }
        self.rq_mut(cpu).need_resched = false;

        let next = self.pick_next_task(cpu);
        if let Some(n) = next {
            self.set_next_task(now, n);
        } else {
            self.rq_mut(cpu).stat.sched_goidle += 1;
        }
        self.rq_mut(cpu).curr = next;
        self.switch_to(now, cpu, prev, next);
    }

    fn scheduler_tick(&mut self, ctx: &mut SimulationContext) {
        let cpu = ctx.active_cpu();
        self.update_curr(ctx, cpu);
        if let Some(curr) = self.rq(cpu).curr {
            match self.task(curr).class() {
                Class::Fair => self.check_preempt_tick(ctx, cpu, curr),
                Class::Rt => self.task_tick_rt(ctx, cpu, curr),
                Class::Stop => {}
            }
        }
        self.trigger_load_balance(ctx, cpu);
    }

    fn run_rebalance(&mut self, ctx: &mut SimulationContext) {
        let cpu = ctx.active_cpu();
        self.run_rebalance_domains(ctx, cpu);
    }

    fn scheduler_ipi(&mut self, ctx: &mut SimulationContext) {
        trace!(cpu = ctx.active_cpu().0, "reschedule ipi");
    }

    fn yield_task(&mut self, ctx: &mut SimulationContext) {
        let cpu = ctx.active_cpu();
        let Some(curr) = self.rq(cpu).curr else {
            return;
        };
        self.rq_mut(cpu).stat.yld_count += 1;
        self.update_curr(ctx, cpu);
        match self.task(curr).class() {
            Class::Fair => {
                if let Some(((right, _), _)) = self.rq(cpu).cfs.rightmost() {
                    let t = self.task_mut(curr);
                    if right > t.vruntime {
                        t.vruntime = Vruntime(right.0.wrapping_add(1));
                    }
                }
            }
            Class::Rt => {
                let idx = self.task(curr).rt_index();
                self.rq_mut(cpu).rt.requeue(idx, curr);
            }
            Class::Stop => {}
        }
        self.resched_curr(ctx, cpu);
    }

    fn run_stop_work(&mut self, ctx: &mut SimulationContext, work: StopWork) {
        let cpu = ctx.active_cpu();
        match work {
            StopWork::ActiveBalance { target } => self.active_load_balance(ctx, cpu, target),
            StopWork::MigrateTask { task, dest } => {
                let t = self.task(task);
                if t.on_rq && t.cpu == cpu && !self.is_running(task) && ctx.cpu_online(dest) {
                    self.move_queued_task(ctx, task, dest);
                }
            }
        }
    }

    fn cpu_down(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        self.update_curr(ctx, cpu);
        if let Some(curr) = self.rq(cpu).curr {
            self.put_prev_task(curr);
            self.rq_mut(cpu).curr = None;
            let now = ctx.now();
            let t = self.task_mut(curr);
            if t.on_rq && t.last_queued.is_none() {
                t.last_queued = Some(now);
            }
        }
        let rq = self.rq(cpu);
        let queued: Vec<TaskId> = rq
            .rt
            .tasks()
            .chain(rq.cfs.iter().map(|(_, id)| id))
            .collect();
        for id in queued {
            let dest = self.fallback_cpu(ctx, id);
            self.move_queued_task(ctx, id, dest);
        }
        self.rq_mut(cpu).need_resched = false;
        debug!(cpu = cpu.0, "cpu down");
    }

    fn cpu_up(&mut self, ctx: &mut SimulationContext, cpu: CpuId) {
        let jiffies = ctx.jiffies();
        let rq = self.rq_mut(cpu);
        rq.next_balance = jiffies;
        rq.last_balance = [jiffies; MAX_DOMAINS];
        rq.balance_failed = [0; MAX_DOMAINS];
        debug!(cpu = cpu.0, "cpu up");
    }

    fn domains_changed(&mut self, ctx: &mut SimulationContext) {
        let jiffies = ctx.jiffies();
        for rq in &mut self.rqs {
            rq.balance_failed = [0; MAX_DOMAINS];
            rq.next_balance = rq.next_balance.min(jiffies);
        }
    }

    fn move_task_group(&mut self, _ctx: &mut SimulationContext, task: TaskId, group: GroupId) {
        self.task_mut(task).group = group;
    }

    fn curr(&self, cpu: CpuId) -> Option<TaskId> {
        self.rq(cpu).curr
    }

    fn need_resched(&self, cpu: CpuId) -> bool {
        self.rq(cpu).need_resched
    }

    fn nr_running(&self, cpu: CpuId) -> usize {
        self.rq(cpu).nr_running
    }

    fn task_info(&self, task: TaskId) -> TaskInfo {
        let t = self.task(task);
        TaskInfo {
            id: task,
            cpu: t.cpu,
            policy: t.policy,
            state: t.state,
            on_rq: t.on_rq,
            weight: t.weight,
            group: t.group,
            cfs_rq: CfsRqId {
                cpu: t.cpu,
                group: GroupId::ROOT,
            },
            vruntime: t.vruntime,
            exec_start: t.exec_start,
            sum_exec_runtime: t.sum_exec_runtime,
            run_delay: t.run_delay,
            pcount: t.pcount,
        }
    }

    fn cpus_allowed(&self, task: TaskId) -> &CpuMask {
        &self.task(task).cpus_allowed
    }

    fn rq_snapshot(&self, cpu: CpuId) -> RqSnapshot {
        let rq = self.rq(cpu);
        RqSnapshot {
            cpu,
            nr_running: rq.nr_running,
            curr: rq.curr,
            stop_on_rq: rq.stop_queued,
            rt: rq.rt.snapshot(),
            cfs: CfsRqSnapshot {
                id: CfsRqId {
                    cpu,
                    group: GroupId::ROOT,
                },
                load_weight: rq.cfs.load_weight,
                nr_running: rq.cfs.nr_running,
                leftmost: rq.cfs.leftmost().map(|(_, id)| EntityKey::Task(id)),
                curr: rq.cfs.curr.map(|id| self.entity_snapshot(id)),
                timeline: rq.cfs.iter().map(|(_, id)| self.entity_snapshot(id)).collect(),
            },
        }
    }

    fn group_load(&self, group: GroupId, cpu: CpuId) -> u64 {
        self.tasks
            .values()
            .filter(|t| t.group == group && t.on_rq && t.cpu == cpu && !t.is_stop)
            .map(|t| t.weight)
            .sum()
    }

    fn schedstat(&self, cpu: CpuId) -> CpuSchedStat {
        self.rq(cpu).stat
    }

    fn domain_schedstat(&self, cpu: CpuId, level: usize) -> DomainSchedStat {
        self.rq(cpu).dom_stat[level]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Topology, TopologyKind};

    fn setup(kind: TopologyKind) -> (SimulationContext, RefScheduler) {
        let mut ctx = SimulationContext::new(Topology::canned(kind));
        let mut sched = RefScheduler::new();
        sched.init(&mut ctx);
        (ctx, sched)
    }

    fn normal() -> SchedPolicy {
        SchedPolicy::Normal { nice: 0 }
    }

    #[test]
    fn test_fork_spreads_over_idle_cpus() {
        let (mut ctx, mut sched) = setup(TopologyKind::QuadCpu);
        for id in 1..=4 {
            sched.fork(&mut ctx, TaskId(id), normal());
        }
        let cpus: Vec<u32> = (1..=4).map(|id| sched.task_info(TaskId(id)).cpu.0).collect();
        assert_eq!(cpus, vec![0, 1, 2, 3]);
        assert!(sched.need_resched(CpuId(0)));
        // Remote CPUs are poked through their trigger timer.
        assert!(ctx.timer_armed(crate::clock::TimerId::Trigger(CpuId(2))));
    }

    #[test]
    fn test_schedule_picks_by_class() {
        let (mut ctx, mut sched) = setup(TopologyKind::Uniprocessor);
        sched.fork(&mut ctx, TaskId(1), normal());
        sched.fork(&mut ctx, TaskId(2), SchedPolicy::Fifo { prio: 10 });
        sched.fork(&mut ctx, TaskId(3), SchedPolicy::Fifo { prio: 50 });
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(0)), Some(TaskId(3)));
        assert_eq!(sched.nr_running(CpuId(0)), 3);

        let stop = TaskId::stop(CpuId(0));
        sched.set_stop_task(&mut ctx, CpuId(0), stop);
        assert!(sched.wake_up(&mut ctx, stop));
        assert!(sched.need_resched(CpuId(0)));
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(0)), Some(stop));

        sched.set_state(stop, TaskState::Interruptible);
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(0)), Some(TaskId(3)));
        assert!(!sched.rq_snapshot(CpuId(0)).stop_on_rq);
    }

    #[test]
    fn test_sleep_and_wakeup_accounting() {
        let (mut ctx, mut sched) = setup(TopologyKind::Uniprocessor);
        sched.fork(&mut ctx, TaskId(1), normal());
        sched.schedule(&mut ctx);
        ctx.advance_clock(2_000_000);
        sched.set_state(TaskId(1), TaskState::Interruptible);
        sched.schedule(&mut ctx);
        let info = sched.task_info(TaskId(1));
        assert!(!info.on_rq);
        assert_eq!(info.sum_exec_runtime, 2_000_000 - crate::clock::BOOT_TIME_NS);
        assert_eq!(sched.curr(CpuId(0)), None);
        assert_eq!(sched.schedstat(CpuId(0)).sched_goidle, 1);

        assert!(sched.wake_up(&mut ctx, TaskId(1)));
        assert!(!sched.wake_up(&mut ctx, TaskId(1)));
        assert_eq!(sched.schedstat(CpuId(0)).ttwu_count, 1);
        ctx.advance_clock(3_000_000);
        sched.schedule(&mut ctx);
        let info = sched.task_info(TaskId(1));
        assert_eq!(info.run_delay, 1_000_000);
        assert_eq!(info.pcount, 2);
    }

    #[test]
    fn test_tick_preempts_after_slice() {
        let (mut ctx, mut sched) = setup(TopologyKind::Uniprocessor);
        sched.fork(&mut ctx, TaskId(1), normal());
        sched.fork(&mut ctx, TaskId(2), normal());
        sched.schedule(&mut ctx);
        let first = sched.curr(CpuId(0));
        assert!(!sched.need_resched(CpuId(0)));
        ctx.advance_clock(crate::types::msecs(4));
        sched.scheduler_tick(&mut ctx);
        assert!(sched.need_resched(CpuId(0)));
        sched.schedule(&mut ctx);
        assert_ne!(sched.curr(CpuId(0)), first);

        let snap = sched.rq_snapshot(CpuId(0));
        assert_eq!(snap.cfs.nr_running, 2);
        assert_eq!(snap.cfs.timeline.len(), 1);
        assert_eq!(snap.cfs.leftmost, Some(snap.cfs.timeline[0].key()));
    }

    #[test]
    fn test_rr_slice_rotates() {
        let (mut ctx, mut sched) = setup(TopologyKind::Uniprocessor);
        sched.fork(&mut ctx, TaskId(1), SchedPolicy::Rr { prio: 20 });
        sched.fork(&mut ctx, TaskId(2), SchedPolicy::Rr { prio: 20 });
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(0)), Some(TaskId(1)));
        for _ in 0..(RR_TIMESLICE_NS / TICK_NS) {
            let next = ctx.now() + TICK_NS;
            ctx.advance_clock(next);
            sched.scheduler_tick(&mut ctx);
        }
        assert!(sched.need_resched(CpuId(0)));
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(0)), Some(TaskId(2)));
    }

    #[test]
    fn test_affinity_change_moves_queued_task() {
        let (mut ctx, mut sched) = setup(TopologyKind::DualCpu);
        sched.fork(&mut ctx, TaskId(1), normal());
        sched.fork(&mut ctx, TaskId(2), normal());
        assert_eq!(sched.task_info(TaskId(2)).cpu, CpuId(1));
        sched.set_cpus_allowed(&mut ctx, TaskId(2), &CpuMask::from_cpu(CpuId(0)));
        assert_eq!(sched.task_info(TaskId(2)).cpu, CpuId(0));
        assert_eq!(sched.nr_running(CpuId(0)), 2);
        assert_eq!(sched.nr_running(CpuId(1)), 0);
        assert_eq!(sched.cpus_allowed(TaskId(2)).weight(), 1);
    }

    #[test]
    fn test_cpu_down_evacuates() {
        let (mut ctx, mut sched) = setup(TopologyKind::DualCpu);
        sched.fork(&mut ctx, TaskId(1), normal());
        sched.fork(&mut ctx, TaskId(2), normal());
        ctx.change_cpu(CpuId(1));
        sched.schedule(&mut ctx);
        assert_eq!(sched.curr(CpuId(1)), Some(TaskId(2)));
        ctx.set_online(CpuId(1), false);
        sched.cpu_down(&mut ctx, CpuId(1));
        assert_eq!(sched.curr(CpuId(1)), None);
        assert_eq!(sched.nr_running(CpuId(1)), 0);
        assert_eq!(sched.task_info(TaskId(2)).cpu, CpuId(0));
    }
}
