//! Randomized workloads checked against invariants that must hold for any
//! mix of tasks, affinities and groups.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use scx_schedsim::lb_score::{LbGroup, LbState, LbTask, ROOT_H_WEIGHT};
use scx_schedsim::sched::CfsRqId;
use scx_schedsim::*;

mod common;
use common::boot;

struct Nothing;

impl Monitor for Nothing {
    fn sample(&mut self, _ctx: &ProbeContext) {}
}

fn random_sim(rng: &mut SmallRng) -> Simulator<RefScheduler> {
    let kind = TopologyKind::ALL[rng.gen_range(0..TopologyKind::ALL.len())];
    let nr_cpus = kind.nr_cpus();
    let mut sim = boot(kind);

    // Each group hangs off the root or off an earlier group.
    let mut groups: Vec<GroupId> = Vec::new();
    for _ in 0..rng.gen_range(0..5) {
        let parent = match rng.gen_range(0..=groups.len()) {
            0 => GroupId::ROOT,
            i => groups[i - 1],
        };
        let g = sim.create_cgroup(parent, None);
        sim.set_group_shares(g, rng.gen_range(2..4096));
        groups.push(g);
    }

    for _ in 0..rng.gen_range(1..3 * nr_cpus + 2) {
        let behavior = TaskBehavior::sleep_run(rng.gen_range(0..20), rng.gen_range(1..30));
        let id = match rng.gen_range(0..10) {
            0 => sim.create_rr_task(behavior, rng.gen_range(1..99)),
            1 => sim.create_batch_task(behavior, rng.gen_range(-20..20)),
            _ => sim.create_normal_task(behavior, rng.gen_range(-20..20)),
        };
        if rng.gen_bool(0.3) {
            let mut mask = CpuMask::new();
            mask.set(CpuId(rng.gen_range(0..nr_cpus as u32)));
            mask.set(CpuId(rng.gen_range(0..nr_cpus as u32)));
            sim.set_cpus_allowed(id, &mask);
        }
        if !groups.is_empty() && rng.gen_bool(0.5) {
            sim.add_task_to_group(id, groups[rng.gen_range(0..groups.len())]);
        }
    }
    sim
}

/// Hierarchical weights always hand out exactly the root's weight, and
/// both placements carry the same total load.
#[test]
fn test_h_weights_conserve_root_weight() {
    let _lock = common::setup_test();
    let mut rng = SmallRng::seed_from_u64(0x5eed);

    for round in 0..8 {
        let mut sim = random_sim(&mut rng);
        sim.run_ticks(1);
        for _ in 0..400 {
            if !sim.step(&mut Nothing) {
                break;
            }
            let state = sim.lb_state();
            if state.tasks.is_empty() {
                continue;
            }
            let hw = state.h_weights();
            let total: f64 = hw.tasks.iter().sum();
            assert!(
                (total - ROOT_H_WEIGHT).abs() < 1e-6,
                "round {round}: task weights sum to {total}"
            );

            let greedy: f64 = state.greedy_balance(&hw).iter().sum();
            let actual: f64 = state.actual_balance(&hw).iter().sum();
            assert!((greedy - actual).abs() < 1e-6, "round {round}: {greedy} vs {actual}");

            let imb = state.imbalance();
            assert!(imb.is_nan() || imb >= 0.0, "round {round}: imbalance {imb}");
        }
    }
}

/// No task runs or waits longer than the run lasted, and no CPU is
/// handed out twice.
#[test]
fn test_time_accounting_bounds() {
    let _lock = common::setup_test();
    let mut rng = SmallRng::seed_from_u64(42);

    for round in 0..6 {
        let mut sim = random_sim(&mut rng);
        let ticks = rng.gen_range(50..400);
        sim.run_ticks(ticks);
        sim.sanity_check_all();

        let elapsed = sim.now();
        let nr_cpus = sim.ctx().online_mask().weight() as u64;
        let mut total = 0;
        for t in sim.tasks() {
            let info = sim.task_info(t.id);
            assert!(
                info.sum_exec_runtime + info.run_delay <= elapsed,
                "round {round}: task {} ran {} and waited {} in {elapsed}",
                t.id,
                info.sum_exec_runtime,
                info.run_delay
            );
            assert!(sim.sched().cpus_allowed(t.id).test(info.cpu));
            total += info.sum_exec_runtime;
        }
        assert!(total <= nr_cpus * elapsed, "round {round}: {total} > {nr_cpus} x {elapsed}");
    }
}

/// Every fired batch moves the clock forward.
#[test]
fn test_clock_is_monotonic() {
    let _lock = common::setup_test();
    let mut rng = SmallRng::seed_from_u64(7);
    let mut sim = random_sim(&mut rng);
    sim.run_ticks(1);
    let mut last = sim.now();
    for _ in 0..2000 {
        if !sim.step(&mut Nothing) {
            break;
        }
        assert!(sim.now() > last);
        last = sim.now();
    }
}

/// Greedy placement of unconstrained tasks in one flat group keeps every
/// CPU within one task's weight of every other.
#[test]
fn test_greedy_flat_spread_within_one_task() {
    let mut rng = SmallRng::seed_from_u64(0xba1);

    for round in 0..200 {
        let nr_cpus = rng.gen_range(1..=24u32);
        let tasks: Vec<LbTask> = (0..rng.gen_range(1..4 * nr_cpus + 4))
            .map(|i| {
                let cpu = CpuId(rng.gen_range(0..nr_cpus));
                LbTask {
                    id: TaskId(i + 1),
                    cpu,
                    weight: rng.gen_range(15..=88761),
                    group: GroupId::ROOT,
                    cfs_rq: CfsRqId {
                        cpu,
                        group: GroupId::ROOT,
                    },
                    cpus_allowed: CpuMask::all(),
                }
            })
            .collect();
        let state = LbState {
            tasks,
            groups: vec![LbGroup {
                id: GroupId::ROOT,
                parent: None,
                shares: 1024,
            }],
            cpus: (0..nr_cpus).map(CpuId).collect(),
        };

        let hw = state.h_weights();
        let heaviest = hw.tasks.iter().copied().fold(0.0, f64::max);
        let greedy = state.greedy_balance(&hw);
        assert!(greedy.windows(2).all(|w| w[0] <= w[1]), "round {round}: {greedy:?}");
        let spread = greedy[greedy.len() - 1] - greedy[0];
        assert!(
            spread <= heaviest + 1e-9,
            "round {round}: spread {spread} exceeds heaviest task {heaviest}"
        );
    }
}
