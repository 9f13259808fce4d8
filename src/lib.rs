//! scx_schedsim - Deterministic discrete-event simulator for a kernel-style
//! CPU scheduler.
//!
//! The simulator drives a scheduler's run queues without running any real
//! work: CPUs, timers, interrupts and task lifecycles are modelled purely
//! as accounting over a virtual clock. Alongside the run it recomputes an
//! ideal greedy placement of the runnable load and scores how far the
//! scheduler's actual placement is from it.
//!
//! # Architecture
//!
//! - **Engine**: event loop over per-CPU timers, firing, deferred work and
//!   re-entry into the scheduler until it settles
//! - **Context**: machine state with an explicit active CPU
//! - **Scheduler**: the scheduler under test behind a trait, with a
//!   built-in reference implementation (stop, RT and fair classes)
//! - **Tasks**: fixed sleep/run, random-distribution and perf replay
//!   behaviors
//! - **Scoring**: greedy-versus-actual load balance imbalance
//! - **Sanity**: run-queue invariant checks after every event
//! - **Workloads**: canned balance tests, Monte-Carlo task groups and
//!   recorded trace replay
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_schedsim::*;
//!
//! let scenario = Scenario::builder()
//!     .topology(TopologyKind::QuadCpu)
//!     .tasks(4, TaskSpec::sleep_run(10, 20))
//!     .ticks(1000)
//!     .build();
//!
//! let sim = scenario.run(RefScheduler::new());
//! sim.print_task_stats(&mut std::io::stdout()).unwrap();
//! ```

pub mod cgroup;
pub mod clock;
pub mod context;
pub mod cpu;
pub mod cpumask;
pub mod dist;
pub mod engine;
pub mod expect;
pub mod fmt;
pub mod irq;
pub mod lb_score;
pub mod lifecycle;
pub mod monitor;
pub mod nohz;
pub mod replay;
pub mod sanity;
pub mod scenario;
pub mod scenarios;
pub mod sched;
pub mod stats;
pub mod task;
pub mod topology;
pub mod types;
pub mod workload;

// Re-export the main public types for convenience.
pub use cpumask::CpuMask;
pub use dist::{DistKind, DistParams, LehmerRng, RandDist};
pub use engine::{RunEnd, SimOptions, Simulator};
pub use expect::{check_delta, ExpectError, Expectations, TaskExpectation};
pub use fmt::{sim_clock, FmtTs, SimFormat};
pub use monitor::{Monitor, ProbeContext, ProbePoint, RunQueueMonitor};
pub use replay::{PidSpec, TraceReplay};
pub use scenario::Scenario;
pub use scenarios::{CannedTest, TEST_NAMES, TEST_TICKS};
pub use sched::{RefScheduler, SchedPolicy, Scheduler, TaskInfo, TaskState};
pub use stats::RunReport;
pub use task::{TaskBehavior, TaskSpec};
pub use topology::{parse_topology, Topology, TopologyKind};
pub use types::{CpuId, GroupId, Pid, TaskId, TimeNs};
pub use workload::{McarloConfig, McarloSim};

use std::sync::Mutex;

/// Global lock for serializing simulator tests.
///
/// Simulations keep their log context per thread, but they share one
/// tracing subscriber; tests that want readable `RUST_LOG` output should
/// hold this lock so runs do not interleave.
pub static SIM_LOCK: Mutex<()> = Mutex::new(());
