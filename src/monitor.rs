//! Monitor trait for mid-simulation state sampling.
//!
//! Monitors are called by the engine at fixed points of every event batch,
//! so tests and tools can sample machine and scheduler state into a time
//! series without touching the engine loop.

use crate::context::SimulationContext;
use crate::sched::Scheduler;
use crate::types::{CpuId, TimeNs};

/// Points of the event loop where monitors are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePoint {
    /// Clock advanced to the batch's event time, before anything fired.
    BatchStart,
    /// A CPU's expired timers ran; deferred work has not been drained.
    Fired,
    /// A CPU finished post-processing (drain, reschedule, nohz, checks).
    PostProcessed,
}

/// Context passed to monitors at each probe point.
pub struct ProbeContext<'a> {
    pub point: ProbePoint,
    /// CPU being processed; `None` at batch start.
    pub cpu: Option<CpuId>,
    pub time_ns: TimeNs,
    /// Read-only machine state.
    pub sim: &'a SimulationContext,
    /// Read-only scheduler state.
    pub sched: &'a dyn Scheduler,
}

/// Trait for mid-simulation state sampling.
pub trait Monitor {
    fn sample(&mut self, ctx: &ProbeContext);
}

/// Records run-queue lengths of every online CPU after each post-process.
#[derive(Debug, Default)]
pub struct RunQueueMonitor {
    /// `(time, cpu, nr_running)` samples.
    pub samples: Vec<(TimeNs, CpuId, usize)>,
}

impl Monitor for RunQueueMonitor {
    fn sample(&mut self, ctx: &ProbeContext) {
        if ctx.point != ProbePoint::PostProcessed {
            return;
        }
        for cpu in ctx.sim.online_cpus() {
            self.samples
                .push((ctx.time_ns, cpu, ctx.sched.nr_running(cpu)));
        }
    }
}
