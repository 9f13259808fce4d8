use scx_schedsim::*;

mod common;
use common::{assert_between, boot, MS};

/// One always-busy task owns a uniprocessor.
#[test]
fn test_single_busy_task_gets_the_cpu() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    let id = sim.create_task(None, 0, 100);
    assert_eq!(sim.run_ticks(500), RunEnd::TicksElapsed);

    let info = sim.task_info(id);
    assert_between("exec time", info.sum_exec_runtime, 495 * MS, 500 * MS);
    assert!(info.run_delay <= MS, "waited {}ns", info.run_delay);
}

/// A task sleeping 8ms and running 2ms runs a fifth of the time.
#[test]
fn test_sleep_run_duty_cycle() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    let id = sim.create_task(None, 8, 2);
    sim.run_ticks(500);

    let info = sim.task_info(id);
    assert_between("exec time", info.sum_exec_runtime, 90 * MS, 110 * MS);
    assert!(info.pcount >= 40, "only {} switches", info.pcount);
    assert!(info.run_delay <= MS, "waited {}ns on an idle cpu", info.run_delay);
}

/// Two busy tasks on one CPU split it evenly.
#[test]
fn test_two_busy_tasks_share_fairly() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    let ids = sim.create_tasks(2, None, 0, 100);
    sim.run_ticks(1000);

    let a = sim.task_info(ids[0]).sum_exec_runtime;
    let b = sim.task_info(ids[1]).sum_exec_runtime;
    assert_between("total", a + b, 990 * MS, 1000 * MS);
    assert!(a.abs_diff(b) <= 10 * MS, "unfair split: {a} vs {b}");
    // Whoever was not running was waiting.
    let delay = sim.task_info(ids[0]).run_delay + sim.task_info(ids[1]).run_delay;
    assert_between("run delay", delay, 400 * MS, 1000 * MS);
}

/// A nice -5 task gets about three times the CPU of a nice 0 task.
#[test]
fn test_weights_bias_the_split() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    let heavy = sim.create_normal_task(TaskBehavior::sleep_run(0, 100), -5);
    let light = sim.create_normal_task(TaskBehavior::sleep_run(0, 100), 0);
    sim.run_ticks(2000);

    let h = sim.task_info(heavy).sum_exec_runtime as f64;
    let l = sim.task_info(light).sum_exec_runtime as f64;
    let ratio = h / l;
    assert!((2.5..3.7).contains(&ratio), "ratio {ratio:.2}");
}

/// Real-time tasks always win over fair ones.
#[test]
fn test_fifo_starves_fair() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::Uniprocessor);
    let fair = sim.create_task(None, 0, 100);
    let rt = sim.create_fifo_task(TaskBehavior::sleep_run(0, 100), 50);
    sim.run_ticks(200);

    assert!(sim.task_info(rt).sum_exec_runtime >= 190 * MS);
    assert!(sim.task_info(fair).sum_exec_runtime <= 10 * MS);
}

/// Run-queue samples never exceed the number of tasks.
#[test]
fn test_run_queue_monitor() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::QuadCpu);
    sim.create_tasks(6, None, 3, 7);
    let mut monitor = RunQueueMonitor::default();
    sim.run_ticks_monitored(300, &mut monitor);

    assert!(!monitor.samples.is_empty());
    assert!(monitor.samples.iter().all(|(_, cpu, n)| cpu.0 < 4 && *n <= 6));
    assert!(monitor.samples.windows(2).all(|w| w[0].0 <= w[1].0));
}

/// The clock only moves forward and the run ends on the requested tick.
#[test]
fn test_run_ends_on_requested_tick() {
    let _lock = common::setup_test();
    let mut sim = boot(TopologyKind::DualCpu);
    sim.create_tasks(3, None, 1, 1);
    sim.run_ticks(100);
    let first = sim.now();
    assert!(sim.ctx().jiffies() >= 100);
    sim.run_ticks(100);
    assert!(sim.now() > first);
    assert!(sim.ctx().jiffies() >= 200);
}
