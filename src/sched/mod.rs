//! The scheduler seam.
//!
//! The engine drives any type implementing [`Scheduler`]: it forks tasks,
//! delivers ticks, wakeups and reschedule requests, and reads back the
//! run-queue state for sanity checking and load-balance scoring. All
//! machine state the scheduler may touch is passed in as
//! [`SimulationContext`].
//!
//! [`RefScheduler`] is the bundled reference implementation: a stop class,
//! a real-time class and a flat completely-fair class with periodic, idle
//! and nohz load balancing over the domain hierarchy.

use serde::Serialize;

use crate::context::SimulationContext;
use crate::cpumask::CpuMask;
use crate::types::{CpuId, GroupId, TaskId, TimeNs, Vruntime};

mod balance;
mod fair;
mod reference;
mod rt;

pub use fair::{SCHED_LATENCY_NS, SCHED_MIN_GRANULARITY_NS, SCHED_WAKEUP_GRANULARITY_NS};
pub use reference::RefScheduler;
pub use rt::{MAX_RT_PRIO, RR_TIMESLICE_NS};

/// Nice 0 load weight.
pub const NICE_0_LOAD: u64 = 1024;

/// Kernel `sched_prio_to_weight[]`, indexed by nice + 20.
const SCHED_PRIO_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, // -20 .. -16
    29154, 23254, 18705, 14949, 11916, // -15 .. -11
    9548, 7620, 6100, 4904, 3906, // -10 .. -6
    3121, 2501, 1991, 1586, 1277, // -5 .. -1
    1024, 820, 655, 526, 423, // 0 .. 4
    335, 272, 215, 172, 137, // 5 .. 9
    110, 87, 70, 56, 45, // 10 .. 14
    36, 29, 23, 18, 15, // 15 .. 19
];

/// Load weight for a nice value, clamped to `[-20, 19]`.
pub fn nice_to_weight(nice: i8) -> u64 {
    let idx = (nice.clamp(-20, 19) as i32 + 20) as usize;
    SCHED_PRIO_TO_WEIGHT[idx]
}

/// Scheduling policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedPolicy {
    Normal { nice: i8 },
    Batch { nice: i8 },
    /// Real-time first-in first-out, priority 1..=99.
    Fifo { prio: u8 },
    /// Real-time round-robin, priority 1..=99.
    Rr { prio: u8 },
}

impl SchedPolicy {
    pub fn is_rt(self) -> bool {
        matches!(self, SchedPolicy::Fifo { .. } | SchedPolicy::Rr { .. })
    }

    /// Load weight; real-time tasks weigh like the highest nice level.
    pub fn weight(self) -> u64 {
        match self {
            SchedPolicy::Normal { nice } | SchedPolicy::Batch { nice } => nice_to_weight(nice),
            SchedPolicy::Fifo { .. } | SchedPolicy::Rr { .. } => nice_to_weight(-20) * 2,
        }
    }
}

/// Task run state (`p->state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Runnable or running.
    Running,
    Interruptible,
    Uninterruptible,
}

/// Identity of a CFS run queue: per CPU, per task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CfsRqId {
    pub cpu: CpuId,
    pub group: GroupId,
}

/// Point-in-time view of one task's scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub cpu: CpuId,
    pub policy: SchedPolicy,
    pub state: TaskState,
    /// Task is queued (or running) on a run queue.
    pub on_rq: bool,
    pub weight: u64,
    pub group: GroupId,
    pub cfs_rq: CfsRqId,
    pub vruntime: Vruntime,
    /// Last time the task's runtime was accounted.
    pub exec_start: TimeNs,
    pub sum_exec_runtime: TimeNs,
    /// Total time spent runnable but waiting for a CPU.
    pub run_delay: TimeNs,
    /// Number of times the task was switched in.
    pub pcount: u64,
}

/// Per-CPU scheduler statistics (`/proc/schedstat` style).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuSchedStat {
    pub yld_count: u64,
    pub sched_count: u64,
    pub sched_goidle: u64,
    pub ttwu_count: u64,
    pub ttwu_local: u64,
    pub rq_cpu_time: TimeNs,
    pub run_delay: TimeNs,
    pub pcount: u64,
}

/// Per-domain load-balancing statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DomainSchedStat {
    pub lb_count: u64,
    pub lb_failed: u64,
    pub lb_balanced: u64,
    pub lb_gained: u64,
    pub lb_nobusyq: u64,
    pub alb_count: u64,
    pub alb_pushed: u64,
    pub idle_lb_count: u64,
    pub ttwu_wake_remote: u64,
}

/// Work executed by a CPU's stop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopWork {
    /// Push a running-queue task from this CPU to `target`.
    ActiveBalance { target: CpuId },
    /// Move `task` to `dest` if it is still queued here.
    MigrateTask { task: TaskId, dest: CpuId },
}

/// A scheduling entity on a CFS run queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub vruntime: Vruntime,
    pub weight: u64,
    pub on_rq: bool,
    /// Run queue the entity believes it is on.
    pub cfs_rq: CfsRqId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntityKind {
    Task { id: TaskId, task_cpu: CpuId },
    Group { group: GroupId, my_q: Box<CfsRqSnapshot> },
}

impl EntitySnapshot {
    pub fn key(&self) -> EntityKey {
        match &self.kind {
            EntityKind::Task { id, .. } => EntityKey::Task(*id),
            EntityKind::Group { group, .. } => EntityKey::Group(*group),
        }
    }
}

/// Identity of an entity for leftmost comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityKey {
    Task(TaskId),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CfsRqSnapshot {
    pub id: CfsRqId,
    pub load_weight: u64,
    pub nr_running: usize,
    /// Cached leftmost entity.
    pub leftmost: Option<EntityKey>,
    /// Running entity, kept out of the timeline.
    pub curr: Option<EntitySnapshot>,
    /// Queued entities in timeline order.
    pub timeline: Vec<EntitySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtRqSnapshot {
    pub rt_nr_running: usize,
    /// Bit `i` set iff queue `i` is non-empty. Lower index is higher priority.
    pub bitmap: u128,
    /// Non-empty priority queues as `(index, tasks)`.
    pub queues: Vec<(usize, Vec<TaskId>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RqSnapshot {
    pub cpu: CpuId,
    pub nr_running: usize,
    pub curr: Option<TaskId>,
    /// Stop task queued (runnable) on this CPU.
    pub stop_on_rq: bool,
    pub rt: RtRqSnapshot,
    pub cfs: CfsRqSnapshot,
}

/// Scheduler policy driven by the engine.
///
/// Mutating operations run on behalf of `ctx.active_cpu()` unless they
/// name a CPU. Implementations must be deterministic.
pub trait Scheduler {
    fn name(&self) -> &str;

    /// Boot: called once after the machine is set up.
    fn init(&mut self, ctx: &mut SimulationContext);

    /// Fork `task` from the active CPU and make it runnable.
    fn fork(&mut self, ctx: &mut SimulationContext, task: TaskId, policy: SchedPolicy);

    /// Install the (initially sleeping) stop task of `cpu`.
    fn set_stop_task(&mut self, ctx: &mut SimulationContext, cpu: CpuId, task: TaskId);

    /// Restrict `task` to `mask`, moving it if it sits on a CPU outside.
    fn set_cpus_allowed(&mut self, ctx: &mut SimulationContext, task: TaskId, mask: &CpuMask);

    /// Wake a sleeping task. Returns whether it was woken.
    fn wake_up(&mut self, ctx: &mut SimulationContext, task: TaskId) -> bool;

    /// Set `p->state`. Takes effect at the next `schedule()`.
    fn set_state(&mut self, task: TaskId, state: TaskState);

    /// Put a queued but not running task to sleep immediately.
    fn dequeue_sleeping(&mut self, ctx: &mut SimulationContext, task: TaskId, state: TaskState);

    /// Pick the next task on the active CPU.
    fn schedule(&mut self, ctx: &mut SimulationContext);

    /// Periodic tick on the active CPU.
    fn scheduler_tick(&mut self, ctx: &mut SimulationContext);

    /// Deferred rebalancing on the active CPU.
    fn run_rebalance(&mut self, ctx: &mut SimulationContext);

    /// Reschedule interrupt delivered to the active CPU.
    fn scheduler_ipi(&mut self, _ctx: &mut SimulationContext) {}

    /// The current task of the active CPU yields.
    fn yield_task(&mut self, ctx: &mut SimulationContext);

    /// Execute stop work on the active CPU.
    fn run_stop_work(&mut self, ctx: &mut SimulationContext, work: StopWork);

    /// `cpu` went offline: migrate everything off it.
    fn cpu_down(&mut self, ctx: &mut SimulationContext, cpu: CpuId);

    fn cpu_up(&mut self, ctx: &mut SimulationContext, cpu: CpuId);

    /// Scheduling domains were rebuilt.
    fn domains_changed(&mut self, _ctx: &mut SimulationContext) {}

    fn move_task_group(&mut self, _ctx: &mut SimulationContext, _task: TaskId, _group: GroupId) {}

    fn set_group_shares(&mut self, _group: GroupId, _shares: u64) {}

    fn curr(&self, cpu: CpuId) -> Option<TaskId>;

    fn need_resched(&self, cpu: CpuId) -> bool;

    fn nr_running(&self, cpu: CpuId) -> usize;

    /// Nothing running and nothing queued.
    fn idle_cpu(&self, cpu: CpuId) -> bool {
        self.curr(cpu).is_none() && self.nr_running(cpu) == 0
    }

    fn task_info(&self, task: TaskId) -> TaskInfo;

    fn cpus_allowed(&self, task: TaskId) -> &CpuMask;

    fn rq_snapshot(&self, cpu: CpuId) -> RqSnapshot;

    /// Load a group's entity would carry on `cpu`.
    fn group_load(&self, _group: GroupId, _cpu: CpuId) -> u64 {
        0
    }

    fn schedstat(&self, _cpu: CpuId) -> CpuSchedStat {
        CpuSchedStat::default()
    }

    fn domain_schedstat(&self, _cpu: CpuId, _level: usize) -> DomainSchedStat {
        DomainSchedStat::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nice_to_weight() {
        assert_eq!(nice_to_weight(0), 1024);
        assert_eq!(nice_to_weight(-20), 88761);
        assert_eq!(nice_to_weight(19), 15);
        assert_eq!(nice_to_weight(100), 15);
        assert_eq!(SchedPolicy::Batch { nice: 5 }.weight(), 335);
        assert!(SchedPolicy::Rr { prio: 10 }.is_rt());
    }
}
