//! Task, group and CPU lifecycle operations on a running simulator.
//!
//! Task ids are dense and start at 1; the per-CPU stop tasks take the
//! first pids at boot, so user task pids follow them.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::clock::TimerId;
use crate::cpumask::CpuMask;
use crate::dist::RandDist;
use crate::engine::Simulator;
use crate::sched::{SchedPolicy, Scheduler, StopWork, TaskState};
use crate::task::{SimTask, TaskBehavior, TaskSpec};
use crate::types::{CpuId, GroupId, TaskId};

impl<S: Scheduler> Simulator<S> {
    /// Fork a task with `behavior` from the active CPU, allowed on every
    /// CPU. While migrations are disabled it stays pinned where it forked.
    pub fn spawn(&mut self, behavior: TaskBehavior, policy: SchedPolicy) -> TaskId {
        let id = TaskId(self.tasks.len() as u32 + 1);
        let pid = self.alloc_pid();
        debug!(task = id.0, pid = pid.0, ?policy, ?behavior, "create task");
        self.tasks.push(SimTask { id, pid, behavior });
        self.sched.fork(&mut self.ctx, id, policy);
        let mask = if self.migrations_disabled {
            CpuMask::from_cpu(self.sched.task_info(id).cpu)
        } else {
            CpuMask::all()
        };
        self.sched.set_cpus_allowed(&mut self.ctx, id, &mask);
        if self.started {
            let cpu = self.ctx.active_cpu();
            self.check_resched(cpu);
        }
        id
    }

    pub fn create_normal_task(&mut self, behavior: TaskBehavior, nice: i8) -> TaskId {
        self.spawn(behavior, SchedPolicy::Normal { nice })
    }

    pub fn create_batch_task(&mut self, behavior: TaskBehavior, nice: i8) -> TaskId {
        self.spawn(behavior, SchedPolicy::Batch { nice })
    }

    pub fn create_fifo_task(&mut self, behavior: TaskBehavior, prio: u8) -> TaskId {
        self.spawn(behavior, SchedPolicy::Fifo { prio })
    }

    pub fn create_rr_task(&mut self, behavior: TaskBehavior, prio: u8) -> TaskId {
        self.spawn(behavior, SchedPolicy::Rr { prio })
    }

    /// A nice-0 sleep/run task restricted to `mask` (all CPUs if `None`).
    pub fn create_task(&mut self, mask: Option<&CpuMask>, sleep_ms: u64, busy_ms: u64) -> TaskId {
        let id = self.create_normal_task(TaskBehavior::sleep_run(sleep_ms, busy_ms), 0);
        if let Some(mask) = mask {
            self.set_cpus_allowed(id, mask);
        }
        id
    }

    /// `count` identical sleep/run tasks.
    pub fn create_tasks(
        &mut self,
        count: usize,
        mask: Option<&CpuMask>,
        sleep_ms: u64,
        busy_ms: u64,
    ) -> Vec<TaskId> {
        (0..count)
            .map(|_| self.create_task(mask, sleep_ms, busy_ms))
            .collect()
    }

    pub fn create_from_spec(&mut self, spec: &TaskSpec) -> TaskId {
        let id = self.spawn(TaskBehavior::sleep_run(spec.sleep_ms, spec.busy_ms), spec.policy);
        if let Some(bits) = spec.cpus_allowed {
            self.set_cpus_allowed(id, &CpuMask::from_bits(bits));
        }
        id
    }

    /// A nice-0 task whose run and sleep lengths are drawn from the given
    /// distributions.
    pub fn create_random_task(&mut self, sleep_dist: RandDist, busy_dist: RandDist) -> TaskId {
        self.create_normal_task(TaskBehavior::random_dist(sleep_dist, busy_dist), 0)
    }

    /// One nice-0 replay task per `*.rlog` file in `dir`, in name order.
    pub fn create_perf_tasks(&mut self, dir: &Path) -> Result<Vec<TaskId>> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("opening {} directory failed", dir.display()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
            if entry.file_name().to_string_lossy().contains(".rlog") {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            let behavior = TaskBehavior::perf_replay_file(&path)?;
            ids.push(self.create_normal_task(behavior, 0));
        }
        info!(dir = %dir.display(), nr_tasks = ids.len(), "created replay tasks");
        Ok(ids)
    }

    pub fn set_cpus_allowed(&mut self, task: TaskId, mask: &CpuMask) {
        self.sched.set_cpus_allowed(&mut self.ctx, task, mask);
    }

    /// Pin every user task to the CPU it is on.
    pub fn disable_migrations(&mut self) {
        for i in 0..self.tasks.len() {
            let id = self.tasks[i].id;
            let cpu = self.sched.task_info(id).cpu;
            self.sched.set_cpus_allowed(&mut self.ctx, id, &CpuMask::from_cpu(cpu));
        }
        self.migrations_disabled = true;
    }

    /// Let every user task run anywhere again.
    pub fn enable_migrations(&mut self) {
        let all = CpuMask::all();
        for i in 0..self.tasks.len() {
            let id = self.tasks[i].id;
            self.sched.set_cpus_allowed(&mut self.ctx, id, &all);
        }
        self.migrations_disabled = false;
    }

    pub fn migrations_disabled(&self) -> bool {
        self.migrations_disabled
    }

    /// Move `task` to `dest` right now. Everything is pinned while it
    /// happens; with `allow_future` the pins are lifted afterwards.
    /// Returns the CPU the task was on.
    pub fn force_migration(&mut self, task: TaskId, dest: CpuId, allow_future: bool) -> CpuId {
        let old = self.sched.task_info(task).cpu;
        self.disable_migrations();
        self.sched.set_cpus_allowed(&mut self.ctx, task, &CpuMask::from_cpu(dest));
        self.ctx.change_cpu(old);
        self.sched.schedule(&mut self.ctx);
        self.ctx.change_cpu(dest);
        self.sched.schedule(&mut self.ctx);
        self.sched.scheduler_ipi(&mut self.ctx);
        if allow_future {
            self.enable_migrations();
        }
        debug!(task = task.0, from = old.0, to = dest.0, "forced migration");
        old
    }

    /// Create a group below `parent`. Unnamed groups are called `cg<id>`.
    pub fn create_cgroup(&mut self, parent: GroupId, name: Option<&str>) -> GroupId {
        let id = self.groups.create(parent, name);
        debug!(group = id.0, path = %self.groups.path(id), "create cgroup");
        id
    }

    pub fn add_task_to_group(&mut self, task: TaskId, group: GroupId) {
        // Validates the group.
        let _ = self.groups.get(group);
        self.sched.move_task_group(&mut self.ctx, task, group);
    }

    pub fn set_group_shares(&mut self, group: GroupId, shares: u64) {
        self.groups.set_shares(group, shares);
        self.sched.set_group_shares(group, shares);
    }

    /// The current task of the active CPU yields.
    pub fn yield_current(&mut self) {
        let cpu = self.ctx.active_cpu();
        if self.sched.curr(cpu).is_some() {
            self.sched.yield_task(&mut self.ctx);
        }
    }

    /// Take `cpu` offline: stop its tick and move everything off it.
    pub fn offline_cpu(&mut self, cpu: CpuId) {
        if !self.ctx.cpu_online(cpu) {
            return;
        }
        info!(cpu = cpu.0, "cpu offline");
        self.ctx.cancel_timer(TimerId::Tick(cpu));
        self.ctx.cpus[cpu.index()].nohz_idle = false;
        self.ctx.set_online(cpu, false);
        self.sched.cpu_down(&mut self.ctx, cpu);
        self.sched.domains_changed(&mut self.ctx);
        self.nohz.track(&self.ctx, cpu);
    }

    /// Bring `cpu` back and restart its tick.
    pub fn online_cpu(&mut self, cpu: CpuId) {
        if self.ctx.cpu_online(cpu) {
            return;
        }
        info!(cpu = cpu.0, "cpu online");
        self.ctx.set_online(cpu, true);
        self.sched.cpu_up(&mut self.ctx, cpu);
        self.sched.domains_changed(&mut self.ctx);
        let expires = self.ctx.next_tick(cpu, self.ctx.now());
        self.ctx.arm_timer_on(cpu, TimerId::Tick(cpu), expires);
        self.nohz.track(&self.ctx, cpu);
    }

    /// Split the domain hierarchy into independent partitions. CPUs in no
    /// partition get no domains and are never balanced.
    pub fn partition_sched_domains(&mut self, partitions: Vec<CpuMask>) {
        debug!(
            partitions = ?partitions.iter().map(CpuMask::to_cpulist).collect::<Vec<_>>(),
            "partition sched domains"
        );
        self.ctx.set_partitions(partitions);
        self.sched.domains_changed(&mut self.ctx);
    }

    /// Run `work` on `cpu` synchronously through its stop task.
    ///
    /// # Panics
    ///
    /// If the stop task does not take the CPU, or keeps it afterwards.
    pub fn stop_one_cpu(&mut self, cpu: CpuId, work: StopWork) {
        let old = self.ctx.active_cpu();
        let stop = TaskId::stop(cpu);
        self.ctx.change_cpu(cpu);
        self.sched.wake_up(&mut self.ctx, stop);
        self.sched.schedule(&mut self.ctx);
        assert_eq!(
            self.sched.curr(cpu),
            Some(stop),
            "stop task did not take cpu {cpu}"
        );
        self.sched.run_stop_work(&mut self.ctx, work);
        self.sched.set_state(stop, TaskState::Interruptible);
        self.sched.schedule(&mut self.ctx);
        self.current_handler();
        assert_ne!(
            self.sched.curr(cpu),
            Some(stop),
            "stop task still running on cpu {cpu}"
        );
        self.ctx.change_cpu(old);
    }

    /// Queue `work` for `cpu`'s stop task; it runs 1 ns from now.
    ///
    /// # Panics
    ///
    /// If stop work is already pending on `cpu`.
    pub fn stop_one_cpu_nowait(&mut self, cpu: CpuId, work: StopWork) {
        self.ctx.queue_stop_work(cpu, work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::RefScheduler;
    use crate::topology::{Topology, TopologyKind};

    fn sim(kind: TopologyKind) -> Simulator<RefScheduler> {
        Simulator::new(Topology::canned(kind), RefScheduler::new())
    }

    #[test]
    fn test_ids_dense_and_pids_after_stop_tasks() {
        let mut s = sim(TopologyKind::DualCpu);
        let a = s.create_task(None, 0, 10);
        let b = s.create_task(None, 0, 10);
        assert_eq!((a, b), (TaskId(1), TaskId(2)));
        assert_eq!(s.task(a).pid.0, 3);
        assert_eq!(s.task(b).pid.0, 4);
        assert_eq!(s.nr_tasks(), 2);
    }

    #[test]
    fn test_mask_is_applied_after_fork() {
        let mut s = sim(TopologyKind::QuadCpu);
        let mask = CpuMask::from_cpu(CpuId(3));
        let id = s.create_task(Some(&mask), 0, 10);
        assert_eq!(s.sched().cpus_allowed(id), &mask);
        assert_eq!(s.task_info(id).cpu, CpuId(3));
    }

    #[test]
    fn test_force_migration_moves_and_pins() {
        let mut s = sim(TopologyKind::QuadCpu);
        let ids = s.create_tasks(2, None, 0, 10);
        let from = s.task_info(ids[0]).cpu;
        let dest = CpuId(3);
        assert_eq!(s.force_migration(ids[0], dest, false), from);
        assert_eq!(s.task_info(ids[0]).cpu, dest);
        assert!(s.migrations_disabled());
        let other = s.task_info(ids[1]).cpu;
        assert_eq!(s.sched().cpus_allowed(ids[1]), &CpuMask::from_cpu(other));

        s.enable_migrations();
        assert_eq!(s.sched().cpus_allowed(ids[1]), &CpuMask::all());
    }

    #[test]
    fn test_groups_and_shares() {
        let mut s = sim(TopologyKind::DualCpu);
        let g = s.create_cgroup(GroupId::ROOT, Some("test"));
        s.set_group_shares(g, 2048);
        let id = s.create_task(None, 0, 10);
        s.add_task_to_group(id, g);
        assert_eq!(s.task_info(id).group, g);
        assert_eq!(s.groups().get(g).shares, 2048);
    }

    #[test]
    fn test_offline_online_cpu() {
        let mut s = sim(TopologyKind::DualCpu);
        let id = s.create_task(None, 0, 10);
        let cpu = s.task_info(id).cpu;
        s.offline_cpu(cpu);
        assert!(!s.ctx().cpu_online(cpu));
        assert_ne!(s.task_info(id).cpu, cpu);
        assert!(!s.ctx().timer_armed(TimerId::Tick(cpu)));
        s.online_cpu(cpu);
        assert!(s.ctx().timer_armed(TimerId::Tick(cpu)));
    }

    #[test]
    fn test_stop_one_cpu_runs_work_and_returns() {
        let mut s = sim(TopologyKind::DualCpu);
        s.run_ticks(1);
        let mask = CpuMask::first_n(2);
        let ids: Vec<_> = (0..3).map(|_| s.create_task(Some(&mask), 0, 1000)).collect();
        let queued = ids
            .iter()
            .copied()
            .find(|id| {
                let info = s.task_info(*id);
                info.on_rq && s.sched().curr(info.cpu) != Some(*id)
            })
            .expect("a queued task");
        let from = s.task_info(queued).cpu;
        let dest = CpuId(1 - from.0);
        s.stop_one_cpu(from, StopWork::MigrateTask { task: queued, dest });
        assert_eq!(s.task_info(queued).cpu, dest);
        assert_ne!(s.sched().curr(from), Some(TaskId::stop(from)));
    }

    #[test]
    #[should_panic(expected = "stop work queued on cpu 1")]
    fn test_double_nowait_is_fatal() {
        let mut s = sim(TopologyKind::DualCpu);
        let work = StopWork::ActiveBalance { target: CpuId(0) };
        s.stop_one_cpu_nowait(CpuId(1), work);
        s.stop_one_cpu_nowait(CpuId(1), work);
    }
}
