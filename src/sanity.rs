//! Run-queue consistency checks.
//!
//! Only the active CPU is checked after each event: other CPUs touched by
//! the same event are checked when they next run. Every violation is a
//! panic naming the CPU and the broken invariant.

use crate::engine::Simulator;
use crate::sched::{CfsRqSnapshot, EntityKind, EntitySnapshot, RqSnapshot, RtRqSnapshot, Scheduler};
use crate::types::CpuId;

fn check_cfs_entity(se: &EntitySnapshot, cfs: &CfsRqSnapshot, active: CpuId) -> usize {
    assert_eq!(
        se.cfs_rq, cfs.id,
        "entity {:?} on cfs_rq {:?} claims {:?}",
        se.key(),
        cfs.id,
        se.cfs_rq
    );
    assert!(se.on_rq, "entity {:?} queued on {:?} but not on_rq", se.key(), cfs.id);
    match &se.kind {
        EntityKind::Group { group, my_q } => {
            let tasks = check_cfs_rq(my_q, active);
            assert!(tasks > 0, "group {} queued on {:?} with no tasks", group.0, cfs.id);
            tasks
        }
        EntityKind::Task { id, task_cpu } => {
            assert_eq!(
                *task_cpu, cfs.id.cpu,
                "task {id} on cpu {} run queue thinks it is on cpu {task_cpu}",
                cfs.id.cpu
            );
            assert_eq!(
                *task_cpu, active,
                "task {id} of cpu {task_cpu} found while checking cpu {active}"
            );
            1
        }
    }
}

/// Check one fair queue; returns the number of tasks below it.
pub fn check_cfs_rq(cfs: &CfsRqSnapshot, active: CpuId) -> usize {
    let mut h_nr_running = 0;
    let mut nr_running = 0;
    let mut load = 0;

    if let Some(curr) = &cfs.curr {
        h_nr_running += check_cfs_entity(curr, cfs, active);
        nr_running += 1;
        load += curr.weight;
    }

    assert_eq!(
        cfs.leftmost,
        cfs.timeline.first().map(EntitySnapshot::key),
        "cached leftmost of {:?} is not the first entity",
        cfs.id
    );

    let mut last = None;
    for se in &cfs.timeline {
        if let Some(prev) = last {
            assert!(
                se.vruntime.delta(prev) >= 0,
                "vruntime order broken on {:?}: {:?} after {:?}",
                cfs.id,
                se.vruntime,
                prev
            );
        }
        last = Some(se.vruntime);
        load += se.weight;
        h_nr_running += check_cfs_entity(se, cfs, active);
        nr_running += 1;
    }

    assert_eq!(load, cfs.load_weight, "load weight of {:?} out of sync", cfs.id);
    assert_eq!(nr_running, cfs.nr_running, "nr_running of {:?} out of sync", cfs.id);
    h_nr_running
}

/// Check the real-time priority array; returns its task count.
pub fn check_rt_rq(rt: &RtRqSnapshot, cpu: CpuId) -> usize {
    let mut nr_running = 0;
    let mut bitmap = 0u128;
    for (idx, tasks) in &rt.queues {
        assert!(
            rt.bitmap & (1 << idx) != 0,
            "rt queue {idx} of cpu {cpu} non-empty but not in bitmap"
        );
        bitmap |= 1 << idx;
        nr_running += tasks.len();
    }
    assert_eq!(bitmap, rt.bitmap, "rt bitmap of cpu {cpu} has empty queues set");
    assert_eq!(nr_running, rt.rt_nr_running, "rt_nr_running of cpu {cpu} out of sync");
    nr_running
}

/// Check a whole run queue against the CPU being processed.
pub fn check_rq(rq: &RqSnapshot, active: CpuId) {
    let mut nr_running = rq.stop_on_rq as usize;
    nr_running += check_rt_rq(&rq.rt, rq.cpu);
    nr_running += check_cfs_rq(&rq.cfs, active);
    assert_eq!(
        nr_running, rq.nr_running,
        "nr_running of cpu {} is {} but classes hold {nr_running}",
        rq.cpu, rq.nr_running
    );
}

impl<S: Scheduler> Simulator<S> {
    /// Check the active CPU's run queue.
    pub fn run_sanity_check(&self) {
        let cpu = self.ctx.active_cpu();
        check_rq(&self.sched.rq_snapshot(cpu), cpu);
    }

    /// Check every online CPU's run queue, each as if it were active.
    pub fn sanity_check_all(&mut self) {
        let old = self.ctx.active_cpu();
        for cpu in self.ctx.online_cpus().collect::<Vec<_>>() {
            self.ctx.change_cpu(cpu);
            self.run_sanity_check();
        }
        self.ctx.change_cpu(old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{CfsRqId, EntityKey};
    use crate::types::{GroupId, TaskId, Vruntime};

    fn cfs_id(cpu: u32) -> CfsRqId {
        CfsRqId {
            cpu: CpuId(cpu),
            group: GroupId::ROOT,
        }
    }

    fn task_se(id: u32, cpu: u32, vruntime: u64) -> EntitySnapshot {
        EntitySnapshot {
            kind: EntityKind::Task {
                id: TaskId(id),
                task_cpu: CpuId(cpu),
            },
            vruntime: Vruntime(vruntime),
            weight: 1024,
            on_rq: true,
            cfs_rq: cfs_id(cpu),
        }
    }

    fn rq(timeline: Vec<EntitySnapshot>) -> RqSnapshot {
        let n = timeline.len();
        RqSnapshot {
            cpu: CpuId(1),
            nr_running: n,
            curr: None,
            stop_on_rq: false,
            rt: RtRqSnapshot {
                rt_nr_running: 0,
                bitmap: 0,
                queues: Vec::new(),
            },
            cfs: CfsRqSnapshot {
                id: cfs_id(1),
                load_weight: 1024 * n as u64,
                nr_running: n,
                leftmost: timeline.first().map(EntitySnapshot::key),
                curr: None,
                timeline,
            },
        }
    }

    #[test]
    fn test_consistent_queue_passes() {
        let snap = rq(vec![task_se(1, 1, 10), task_se(2, 1, 10), task_se(3, 1, 30)]);
        check_rq(&snap, CpuId(1));
    }

    #[test]
    #[should_panic(expected = "vruntime order broken")]
    fn test_unordered_timeline_is_fatal() {
        let snap = rq(vec![task_se(1, 1, 30), task_se(2, 1, 10)]);
        check_rq(&snap, CpuId(1));
    }

    #[test]
    #[should_panic(expected = "load weight")]
    fn test_load_mismatch_is_fatal() {
        let mut snap = rq(vec![task_se(1, 1, 10)]);
        snap.cfs.load_weight = 2048;
        check_rq(&snap, CpuId(1));
    }

    #[test]
    #[should_panic(expected = "found while checking cpu 0")]
    fn test_wrong_active_cpu_is_fatal() {
        let snap = rq(vec![task_se(1, 1, 10)]);
        check_rq(&snap, CpuId(0));
    }

    #[test]
    #[should_panic(expected = "cached leftmost")]
    fn test_stale_leftmost_is_fatal() {
        let mut snap = rq(vec![task_se(1, 1, 10), task_se(2, 1, 20)]);
        snap.cfs.leftmost = Some(EntityKey::Task(TaskId(2)));
        check_rq(&snap, CpuId(1));
    }

    #[test]
    #[should_panic(expected = "nr_running of cpu 1")]
    fn test_total_mismatch_is_fatal() {
        let mut snap = rq(vec![task_se(1, 1, 10)]);
        snap.stop_on_rq = true;
        check_rq(&snap, CpuId(1));
    }

    #[test]
    fn test_rt_array_counts() {
        let rt = RtRqSnapshot {
            rt_nr_running: 3,
            bitmap: (1 << 5) | (1 << 40),
            queues: vec![(5, vec![TaskId(1), TaskId(2)]), (40, vec![TaskId(3)])],
        };
        assert_eq!(check_rt_rq(&rt, CpuId(0)), 3);
    }
}
