//! Scenario definition and builder API.

use crate::engine::{SimOptions, Simulator};
use crate::sched::Scheduler;
use crate::task::TaskSpec;
use crate::topology::{Topology, TopologyKind};

/// A complete simulation scenario: machine, tasks and duration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub topology: TopologyKind,
    pub tasks: Vec<TaskSpec>,
    pub ticks: u64,
    pub options: SimOptions,
}

/// Builder for constructing scenarios.
pub struct ScenarioBuilder {
    topology: TopologyKind,
    tasks: Vec<TaskSpec>,
    ticks: u64,
    options: SimOptions,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            topology: TopologyKind::Uniprocessor,
            tasks: Vec::new(),
            ticks: 100, // 100ms at HZ=1000
            options: SimOptions::default(),
        }
    }

    /// Boot the machine with `sched`, create the tasks in order and run
    /// for the scenario's ticks.
    pub fn run<S: Scheduler>(&self, sched: S) -> Simulator<S> {
        let mut sim = Simulator::new(Topology::canned(self.topology), sched).with_options(self.options);
        for spec in &self.tasks {
            sim.create_from_spec(spec);
        }
        sim.run_ticks(self.ticks);
        sim
    }
}

impl ScenarioBuilder {
    pub fn topology(mut self, kind: TopologyKind) -> Self {
        self.topology = kind;
        self
    }

    /// Add one task.
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    /// Add `count` copies of `spec`.
    pub fn tasks(mut self, count: usize, spec: TaskSpec) -> Self {
        self.tasks.extend(std::iter::repeat(spec).take(count));
        self
    }

    /// Set the simulation duration in ticks.
    pub fn ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn options(mut self, options: SimOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the scenario.
    pub fn build(self) -> Scenario {
        assert!(!self.tasks.is_empty(), "scenario must have at least one task");
        assert!(self.ticks > 0, "scenario must run for at least one tick");
        Scenario {
            topology: self.topology,
            tasks: self.tasks,
            ticks: self.ticks,
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::RefScheduler;

    #[test]
    fn test_builder_runs_tasks() {
        let scenario = Scenario::builder()
            .topology(TopologyKind::DualCpu)
            .tasks(2, TaskSpec::sleep_run(0, 50))
            .task(TaskSpec::sleep_run(5, 5).cpus_allowed(0x1))
            .ticks(50)
            .build();
        let sim = scenario.run(RefScheduler::new());
        assert_eq!(sim.nr_tasks(), 3);
        assert!(sim.ctx().jiffies() >= 50);
        assert_eq!(sim.task_info(crate::types::TaskId(3)).cpu.0, 0);
    }

    #[test]
    #[should_panic(expected = "at least one task")]
    fn test_empty_scenario_is_rejected() {
        Scenario::builder().build();
    }
}
