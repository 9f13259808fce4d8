//! Expectations on per-task statistics, with support for expected
//! failures.
//!
//! A check may be marked as expected to fail. For a single check the
//! failure is then recorded instead of reported, and a pass is itself an
//! error ("unexpected success"). For an aggregate over a task range the
//! whole range counts as one expected failure if any member fails.

use std::error::Error;
use std::fmt;

use serde::Serialize;

use crate::engine::Simulator;
use crate::sched::Scheduler;
use crate::types::{TaskId, NSEC_PER_MSEC};

/// Whether `v` lies in `[max(0, expect - delta), expect + delta]`.
pub fn check_delta(v: u64, expect: u64, delta: u64) -> bool {
    if delta < expect && v + delta < expect {
        return false;
    }
    v <= expect + delta
}

/// Expected statistics for tasks `low..=high`, runtimes in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskExpectation {
    pub low: u32,
    pub high: u32,
    pub runtime_ms: u64,
    pub runtime_delta_ms: u64,
    pub wait_ms: u64,
    pub wait_delta_ms: u64,
    pub pcount: u64,
    pub pcount_delta: u64,
}

impl TaskExpectation {
    /// `[low, high, runtime, runtime_d, wait, wait_d, pcount, pcount_d]`
    pub const fn from_results(r: [u64; 8]) -> Self {
        TaskExpectation {
            low: r[0] as u32,
            high: r[1] as u32,
            runtime_ms: r[2],
            runtime_delta_ms: r[3],
            wait_ms: r[4],
            wait_delta_ms: r[5],
            pcount: r[6],
            pcount_delta: r[7],
        }
    }

    fn describe(&self, who: &str) -> String {
        format!(
            "expected {who} to have:\n\
             runtime: {} ms +- {} ms\n\
             run_delay: {} ms +- {} ms\n\
             pcount: {} +- {}\n\
             -----------------\n",
            self.runtime_ms,
            self.runtime_delta_ms,
            self.wait_ms,
            self.wait_delta_ms,
            self.pcount,
            self.pcount_delta
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectError {
    /// A check failed that was expected to pass.
    Mismatch { report: String },
    /// A check passed that was expected to fail.
    UnexpectedSuccess { report: String },
}

impl fmt::Display for ExpectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectError::Mismatch { report } => f.write_str(report.trim_end()),
            ExpectError::UnexpectedSuccess { report } => {
                write!(f, "Unexpected success:\n{}", report.trim_end())
            }
        }
    }
}

impl Error for ExpectError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Pass,
    Fail,
    /// Inside an aggregate that is expected to fail as a whole.
    AggregateFail,
}

/// Expectation state for one test.
#[derive(Debug, Default)]
pub struct Expectations {
    mode: Mode,
    expected_failures: usize,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the next check (or aggregate) as expected to fail.
    pub fn expect_failure(&mut self) {
        self.mode = Mode::Fail;
    }

    pub fn expected_failures(&self) -> usize {
        self.expected_failures
    }

    /// Whether a check with outcome `failed` must be reported.
    fn check_unexpected(&mut self, failed: bool) -> bool {
        match self.mode {
            Mode::AggregateFail => {
                if failed {
                    self.expected_failures += 1;
                }
                false
            }
            Mode::Fail => {
                if failed {
                    self.expected_failures += 1;
                    self.mode = Mode::Pass;
                }
                !failed
            }
            Mode::Pass => failed,
        }
    }

    fn error(&self, report: String) -> ExpectError {
        if self.mode == Mode::Pass {
            ExpectError::Mismatch { report }
        } else {
            ExpectError::UnexpectedSuccess { report }
        }
    }

    /// A free-form condition.
    pub fn check(&mut self, succeeded: bool, what: &str) -> Result<(), ExpectError> {
        if self.check_unexpected(!succeeded) {
            return Err(self.error(format!("Check `{what}'\n")));
        }
        Ok(())
    }

    /// Check one task against `e`, ignoring its task range.
    pub fn expect_task_all<S: Scheduler>(
        &mut self,
        sim: &Simulator<S>,
        task: TaskId,
        e: &TaskExpectation,
    ) -> Result<(), ExpectError> {
        let info = sim.task_info(task);
        let ok = check_delta(
            info.sum_exec_runtime,
            e.runtime_ms * NSEC_PER_MSEC,
            e.runtime_delta_ms * NSEC_PER_MSEC,
        ) && check_delta(
            info.run_delay,
            e.wait_ms * NSEC_PER_MSEC,
            e.wait_delta_ms * NSEC_PER_MSEC,
        ) && check_delta(info.pcount, e.pcount, e.pcount_delta);

        if self.check_unexpected(!ok) {
            let report = e.describe(&format!("process {}", task.0)) + &task_stats(sim);
            return Err(self.error(report));
        }
        Ok(())
    }

    /// Check every task in `e.low..=e.high`.
    pub fn expect_tasks_all<S: Scheduler>(
        &mut self,
        sim: &Simulator<S>,
        e: &TaskExpectation,
    ) -> Result<(), ExpectError> {
        let prev_fails = self.expected_failures;
        if self.mode != Mode::Pass {
            self.mode = Mode::AggregateFail;
        }
        for id in e.low..=e.high {
            self.expect_task_all(sim, TaskId(id), e)?;
        }
        if self.mode == Mode::Pass {
            return Ok(());
        }

        self.mode = Mode::Pass;
        if self.expected_failures == prev_fails {
            let who = format!("processes {}-{}", e.low, e.high);
            return Err(ExpectError::UnexpectedSuccess {
                report: e.describe(&who) + &task_stats(sim),
            });
        }
        self.expected_failures = prev_fails + 1;
        Ok(())
    }

    pub fn validate_results<S: Scheduler>(
        &mut self,
        sim: &Simulator<S>,
        e: &TaskExpectation,
    ) -> Result<(), ExpectError> {
        self.expect_tasks_all(sim, e)
    }

    /// `test <name> had <n> expected failures`, if there were any.
    pub fn summary(&self, name: &str) -> Option<String> {
        (self.expected_failures > 0)
            .then(|| format!("test {name} had {} expected failures", self.expected_failures))
    }
}

fn task_stats<S: Scheduler>(sim: &Simulator<S>) -> String {
    let mut out = Vec::new();
    match sim.print_task_stats(&mut out) {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::RefScheduler;
    use crate::topology::{Topology, TopologyKind};

    #[test]
    fn test_check_delta() {
        assert!(check_delta(100, 100, 0));
        assert!(check_delta(95, 100, 5));
        assert!(!check_delta(94, 100, 5));
        assert!(check_delta(105, 100, 5));
        assert!(!check_delta(106, 100, 5));
        // The lower bound saturates at zero.
        assert!(check_delta(0, 3, 10));
        assert!(!check_delta(14, 3, 10));
    }

    #[test]
    fn test_expected_failure_single() {
        let mut e = Expectations::new();
        e.expect_failure();
        e.check(false, "fails").unwrap();
        assert_eq!(e.expected_failures(), 1);
        // The expectation was consumed.
        assert!(matches!(e.check(false, "x"), Err(ExpectError::Mismatch { .. })));

        e.expect_failure();
        let err = e.check(true, "passes").unwrap_err();
        assert!(matches!(err, ExpectError::UnexpectedSuccess { .. }));
        assert!(err.to_string().starts_with("Unexpected success:\nCheck `passes'"));
    }

    fn sim_with_tasks() -> Simulator<RefScheduler> {
        let mut s = Simulator::new(Topology::canned(TopologyKind::DualCpu), RefScheduler::new());
        s.create_tasks(2, None, 0, 100);
        s.run_ticks(100);
        s
    }

    #[test]
    fn test_aggregate_expectations() {
        let s = sim_with_tasks();
        let good = TaskExpectation::from_results([1, 2, 100, 5, 0, 1, 1, 1]);
        let bad = TaskExpectation::from_results([1, 2, 10, 1, 0, 1, 1, 1]);

        let mut e = Expectations::new();
        e.validate_results(&s, &good).unwrap();

        let err = e.validate_results(&s, &bad).unwrap_err();
        assert!(err.to_string().starts_with("expected process 1 to have:\nruntime: 10 ms +- 1 ms"));
        assert!(err.to_string().contains("Task id = "));

        e.expect_failure();
        e.validate_results(&s, &bad).unwrap();
        assert_eq!(e.expected_failures(), 1);
        assert_eq!(e.summary("t").as_deref(), Some("test t had 1 expected failures"));

        e.expect_failure();
        let err = e.validate_results(&s, &good).unwrap_err();
        assert!(matches!(err, ExpectError::UnexpectedSuccess { .. }));
        assert!(err.to_string().contains("expected processes 1-2 to have:"));
    }
}
