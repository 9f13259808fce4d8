//! Canned load-balancing tests.
//!
//! Each test boots a topology, creates a set of sleep/run tasks, runs for
//! a minute of simulated time and checks every task's runtime, run delay
//! and switch count against a per-topology table.

use anyhow::{bail, Result};
use tracing::info;

use crate::cpumask::CpuMask;
use crate::engine::{SimOptions, Simulator};
use crate::expect::{Expectations, TaskExpectation};
use crate::sched::RefScheduler;
use crate::topology::{Topology, TopologyKind};

/// One minute at HZ=1000.
pub const TEST_TICKS: u64 = 60_000;

pub const TEST_NAMES: [&str; 4] = ["trivial_bal", "basic_bal1", "basic_bal2", "bal1"];

/// `count` identical tasks allowed on `mask`.
#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub count: usize,
    pub mask: CpuMask,
    pub sleep_ms: u64,
    pub busy_ms: u64,
}

/// A canned test instantiated for one topology.
#[derive(Debug, Clone)]
pub struct CannedTest {
    pub name: &'static str,
    pub topology: TopologyKind,
    pub batches: Vec<TaskBatch>,
    pub ticks: u64,
    pub expectations: Vec<TaskExpectation>,
    /// The first expectation is a known failure on this topology.
    pub expect_failure: bool,
}

const fn e(r: [u64; 8]) -> TaskExpectation {
    TaskExpectation::from_results(r)
}

fn unsupported(name: &str, kind: TopologyKind) -> anyhow::Error {
    anyhow::anyhow!("test {name} has no expectations for topology {kind}")
}

impl CannedTest {
    /// Look up test `name` for `kind`.
    pub fn new(name: &str, kind: TopologyKind) -> Result<CannedTest> {
        use TopologyKind::*;

        let nr = kind.nr_cpus();
        let all = CpuMask::first_n(nr);
        let n = nr as u64;
        let batch = |count: usize, sleep_ms, busy_ms| TaskBatch {
            count,
            mask: all.clone(),
            sleep_ms,
            busy_ms,
        };
        let mut expect_failure = false;

        let (name, batches, expectations) = match name {
            // A task per CPU with no overhead at all.
            "trivial_bal" => (
                "trivial_bal",
                vec![batch(nr, 0, 100)],
                vec![e([1, n, TEST_TICKS, 1, 0, 1, 1, 0])],
            ),
            // More sleep/run tasks than CPUs, needing at most every CPU.
            "basic_bal1" => {
                let (extra, r) = match kind {
                    Uniprocessor => (1, [26080, 10, 20880, 10, 6520, 10]),
                    DualCpu | DualCpuMc => (2, [27274, 100, 19000, 1000, 4090, 10]),
                    QuadCpu | QuadCpuMc => (4, [30000, 1, 15000, 1000, 3000, 1]),
                    QuadCpuDualSocket => {
                        expect_failure = true;
                        (4, [36000, 1000, 6000, 700, 2600, 200])
                    }
                    QuadCpuQuadSocket => (4, [40000, 600, 3000, 3000, 2000, 150]),
                    HexCpuDualSocketSmt => (6, [39200, 1000, 1000, 300, 2520, 100]),
                };
                let count = nr + extra;
                (
                    "basic_bal1",
                    vec![batch(count, 10, 20)],
                    vec![e([1, count as u64, r[0], r[1], r[2], r[3], r[4], r[5]])],
                )
            }
            // As above with longer intervals, so less overhead is allowed.
            "basic_bal2" => {
                let (extra, r) = match kind {
                    Uniprocessor => (1, [24200, 100, 23700, 100, 6050, 10]),
                    DualCpu | DualCpuMc => (2, [24200, 200, 23700, 300, 3510, 10]),
                    QuadCpu | QuadCpuMc => (4, [24510, 200, 23300, 300, 2450, 10]),
                    QuadCpuDualSocket => (4, [38350, 1000, 2400, 500, 450, 100]),
                    QuadCpuQuadSocket => (4, [39000, 500, 1200, 200, 380, 80]),
                    HexCpuDualSocketSmt => (6, [39000, 600, 1300, 500, 385, 65]),
                };
                let count = nr + extra;
                (
                    "basic_bal2",
                    vec![batch(count, 100, 200)],
                    vec![e([1, count as u64, r[0], r[1], r[2], r[3], r[4], r[5]])],
                )
            }
            // basic_bal2 plus two busy tasks locked to CPUs 0-1.
            "bal1" => {
                let (first, second) = match kind {
                    QuadCpu => (
                        [28500, 600, 17000, 1000, 1800, 100],
                        [32500, 600, 19000, 500, 2000, 100],
                    ),
                    QuadCpuMc => (
                        [29000, 1000, 16500, 2000, 1800, 200],
                        [32500, 800, 19000, 1400, 2050, 150],
                    ),
                    QuadCpuDualSocket => (
                        [37300, 500, 4000, 500, 600, 50],
                        [43000, 500, 6000, 500, 700, 50],
                    ),
                    QuadCpuQuadSocket => (
                        [39000, 500, 2500, 2000, 350, 70],
                        [46750, 250, 1300, 200, 330, 100],
                    ),
                    HexCpuDualSocketSmt => (
                        [39200, 500, 1000, 500, 350, 50],
                        [46000, 2500, 2200, 100, 430, 10],
                    ),
                    Uniprocessor | DualCpu | DualCpuMc => return Err(unsupported(name, kind)),
                };
                let count = nr + 2;
                let c = count as u64;
                let pinned = TaskBatch {
                    count: 2,
                    mask: CpuMask::first_n(2),
                    sleep_ms: 50,
                    busy_ms: 200,
                };
                (
                    "bal1",
                    vec![batch(count, 100, 200), pinned],
                    vec![
                        e([1, c, first[0], first[1], first[2], first[3], first[4], first[5]]),
                        e([c + 1, c + 2, second[0], second[1], second[2], second[3], second[4], second[5]]),
                    ],
                )
            }
            _ => bail!("unknown test {name:?}; known tests: {}", TEST_NAMES.join(", ")),
        };

        Ok(CannedTest {
            name,
            topology: kind,
            batches,
            ticks: TEST_TICKS,
            expectations,
            expect_failure,
        })
    }

    /// Override the run length, for quick runs of the same shape.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Create the tasks and run the test without checking anything.
    pub fn simulate(&self, options: SimOptions) -> Simulator<RefScheduler> {
        let mut sim =
            Simulator::new(Topology::canned(self.topology), RefScheduler::new()).with_options(options);
        for b in &self.batches {
            sim.create_tasks(b.count, Some(&b.mask), b.sleep_ms, b.busy_ms);
        }
        info!(test = self.name, topology = %self.topology, ticks = self.ticks, "running canned test");
        sim.run_ticks(self.ticks);
        sim
    }

    /// Check `sim` against the expectation tables.
    pub fn validate(&self, sim: &Simulator<RefScheduler>) -> Result<Expectations> {
        let mut exp = Expectations::new();
        if self.expect_failure {
            exp.expect_failure();
        }
        for e in &self.expectations {
            exp.validate_results(sim, e)?;
        }
        Ok(exp)
    }
}
