use scx_schedsim::*;

mod common;
use common::{boot, MS};

/// Taking a CPU down mid-run moves its work elsewhere and the run goes on.
#[test]
fn test_hotplug_during_run() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpu);
    let ids = sim.create_tasks(4, None, 0, 100);
    sim.run_ticks(100);

    let victim = CpuId(2);
    sim.offline_cpu(victim);
    let before: Vec<u64> = ids.iter().map(|id| sim.task_info(*id).sum_exec_runtime).collect();
    sim.run_ticks(300);

    for (id, prev) in ids.iter().zip(&before) {
        let info = sim.task_info(*id);
        assert_ne!(info.cpu, victim, "task {id} left on an offline cpu");
        assert!(info.sum_exec_runtime > *prev, "task {id} stopped running");
    }
    assert!(!sim.ctx().online_mask().test(victim));

    sim.online_cpu(victim);
    sim.run_ticks(100);
    assert!(sim.ctx().cpu_online(victim));
    sim.sanity_check_all();
}

/// Narrowing a task's affinity while it runs moves it for good.
#[test]
fn test_affinity_change_mid_run() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpu);
    let ids = sim.create_tasks(3, None, 2, 8);
    sim.run_ticks(50);

    let pin = CpuMask::from_cpu(CpuId(3));
    sim.set_cpus_allowed(ids[0], &pin);
    assert_eq!(sim.sched().cpus_allowed(ids[0]), &pin);
    for _ in 0..10 {
        sim.run_ticks(20);
        assert_eq!(sim.task_info(ids[0]).cpu, CpuId(3));
    }
}

/// With migrations disabled nothing moves, even when badly placed.
#[test]
fn test_disabled_migrations_pin_everything() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::DualCpu);
    let ids = sim.create_tasks(4, Some(&CpuMask::from_cpu(CpuId(0))), 0, 100);
    sim.run_ticks(10);
    sim.disable_migrations();
    sim.run_ticks(200);
    for id in &ids {
        assert_eq!(sim.task_info(*id).cpu, CpuId(0));
    }

    sim.enable_migrations();
    sim.run_ticks(500);
    let moved = ids.iter().filter(|id| sim.task_info(**id).cpu == CpuId(1)).count();
    assert!(moved > 0, "balancer never used the idle cpu");
}

/// Tasks created while migrations are disabled stay where they forked.
#[test]
fn test_tasks_created_while_pinned_stay_put() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpu);
    sim.create_tasks(2, None, 0, 100);
    sim.run_ticks(10);
    sim.disable_migrations();

    let late = sim.create_task(None, 0, 100);
    let cpu = sim.task_info(late).cpu;
    assert_eq!(sim.sched().cpus_allowed(late), &CpuMask::from_cpu(cpu));
    sim.run_ticks(200);
    assert_eq!(sim.task_info(late).cpu, cpu);

    sim.enable_migrations();
    assert_eq!(sim.sched().cpus_allowed(late), &CpuMask::all());
}

/// Forced migration with future migrations allowed leaves nothing pinned.
#[test]
fn test_force_migration_then_run() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpuMc);
    let ids = sim.create_tasks(2, None, 1, 4);
    sim.run_ticks(20);

    let from = sim.force_migration(ids[1], CpuId(3), true);
    assert_eq!(sim.task_info(ids[1]).cpu, CpuId(3));
    assert!(!sim.migrations_disabled());
    assert_eq!(sim.sched().cpus_allowed(ids[1]), &CpuMask::all());
    assert!(from.0 < 4);

    let runtime = sim.task_info(ids[1]).sum_exec_runtime;
    sim.run_ticks(100);
    assert!(sim.task_info(ids[1]).sum_exec_runtime > runtime);
}

/// Partitions get independent domain trees that never cross.
#[test]
fn test_partitioned_domains() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpuDualSocket);
    let left = CpuMask::from_cpulist("0-3").unwrap();
    let right = CpuMask::from_cpulist("4-7").unwrap();
    sim.partition_sched_domains(vec![left.clone(), right.clone()]);
    assert_eq!(sim.ctx().partitions().len(), 2);

    for cpu in sim.ctx().online_cpus() {
        let part = if left.test(cpu) { &left } else { &right };
        for sd in sim.ctx().sched_domains(cpu) {
            assert!(sd.span.is_subset(part), "domain {} of cpu {cpu} crosses", sd.name());
        }
    }

    let ids = sim.create_tasks(6, Some(&left), 0, 50);
    sim.run_ticks(300);
    for id in ids {
        assert!(left.test(sim.task_info(id).cpu));
        assert!(sim.task_info(id).sum_exec_runtime > 100 * MS);
    }
}

/// Tasks moved into a group report under it, and group time sums up.
#[test]
fn test_group_accounting() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::DualCpu);
    let parent = sim.create_cgroup(GroupId::ROOT, Some("outer"));
    let child = sim.create_cgroup(parent, None);
    sim.set_group_shares(child, 512);
    let a = sim.create_task(None, 0, 100);
    let b = sim.create_task(None, 0, 100);
    sim.add_task_to_group(a, parent);
    sim.add_task_to_group(b, child);
    sim.run_ticks(200);

    assert_eq!(sim.task_info(b).group, child);
    let reports = sim.group_reports();
    let outer = reports.iter().find(|g| g.id == parent).unwrap();
    let inner = reports.iter().find(|g| g.id == child).unwrap();
    assert_eq!(inner.shares, 512);
    assert!(inner.path.starts_with("/outer/"));
    assert_eq!(outer.exec_time, sim.task_exec_time(a) + sim.task_exec_time(b));
    assert_eq!(inner.exec_time, sim.task_exec_time(b));
}

/// Perf run logs drive tasks through their recorded runs and sleeps.
#[test]
fn test_perf_replay_tasks() {
    let _lock = common::setup_test();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.rlog"),
        "0,R,0,5000000\n0,S,0,5000000\n0,R,0,5000000\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("b.rlog"), "0,R,0,20000000\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

    let mut sim = boot(TopologyKind::Uniprocessor);
    let ids = sim.create_perf_tasks(dir.path()).unwrap();
    assert_eq!(ids.len(), 2);
    sim.run_ticks(200);

    let a = sim.task_info(ids[0]).sum_exec_runtime;
    let b = sim.task_info(ids[1]).sum_exec_runtime;
    assert!((9 * MS..=11 * MS).contains(&a), "a ran {a}");
    assert!((19 * MS..=21 * MS).contains(&b), "b ran {b}");
}
