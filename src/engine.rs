//! Discrete-event simulation engine.
//!
//! The engine owns the machine, the scheduler under test and the simulated
//! tasks. Each iteration of the event loop takes the earliest programmed
//! event over all CPUs, advances the virtual clock to it and processes
//! every CPU whose event is due, in ascending CPU order: the CPU's expired
//! timers fire inside interrupt context, then deferred work is drained, the
//! scheduler is re-entered until no reschedule is pending, the CPU enters
//! or leaves the tick-stopped state and its run queue is checked.

use std::fmt;
use std::io::{self, Write};

use tracing::{debug, info, trace, warn};

use crate::cgroup::GroupRegistry;
use crate::clock::{TimerId, KTIME_MAX};
use crate::context::SimulationContext;
use crate::lb_score::LbTracker;
use crate::monitor::{Monitor, ProbeContext, ProbePoint};
use crate::nohz::NohzTracker;
use crate::sched::{Scheduler, TaskInfo, TaskState};
use crate::task::{SimTask, TaskBehavior, TaskEnv};
use crate::topology::Topology;
use crate::types::{CpuId, Pid, TaskId, TimeNs};

/// Bound on scheduler re-entries for one CPU before the decision loop is
/// considered runaway.
pub const MAX_RESCHED_ROUNDS: usize = 10_000;

/// Per-run switches of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions {
    /// Print the imbalance score of every event batch.
    pub dump_imbalance: bool,
    /// Print the full placement before every scored batch.
    pub dump_full_balance: bool,
    /// Check the active CPU's run queue after every post-process.
    pub sanity_check: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            dump_imbalance: false,
            dump_full_balance: false,
            sanity_check: true,
        }
    }
}

impl SimOptions {
    /// Defaults, with the dump switches taken from `SCHEDSIM_DUMP_IMBALANCE`
    /// and `SCHEDSIM_DUMP_FULL_BALANCE` when set to `1`.
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).is_ok_and(|v| v == "1");
        SimOptions {
            dump_imbalance: flag("SCHEDSIM_DUMP_IMBALANCE"),
            dump_full_balance: flag("SCHEDSIM_DUMP_FULL_BALANCE"),
            ..SimOptions::default()
        }
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The requested number of ticks elapsed.
    TicksElapsed,
    /// No timer is armed anywhere.
    NoEvents,
}

struct NoMonitor;

impl Monitor for NoMonitor {
    fn sample(&mut self, _ctx: &ProbeContext) {}
}

/// The simulator: machine, scheduler and tasks.
pub struct Simulator<S: Scheduler> {
    pub(crate) ctx: SimulationContext,
    pub(crate) sched: S,
    /// User tasks; index is `TaskId::index()`.
    pub(crate) tasks: Vec<SimTask>,
    /// Per-CPU stop tasks.
    pub(crate) stop_tasks: Vec<SimTask>,
    pub(crate) groups: GroupRegistry,
    pub(crate) lb: LbTracker,
    pub(crate) nohz: NohzTracker,
    pub(crate) options: SimOptions,
    pub(crate) next_pid: i32,
    pub(crate) migrations_disabled: bool,
    /// Set once the event loop has run; task creation reschedules from then on.
    pub(crate) started: bool,
    out: Box<dyn Write>,
}

impl<S: Scheduler> fmt::Debug for Simulator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator").finish_non_exhaustive()
    }
}

impl<S: Scheduler> Simulator<S> {
    /// Boot `topology` with `sched`: every CPU gets its stop task and its
    /// periodic tick.
    pub fn new(topology: Topology, mut sched: S) -> Self {
        let mut ctx = SimulationContext::new(topology);
        sched.init(&mut ctx);
        let nr = ctx.nr_cpu_ids();
        info!(
            topology = ctx.topology().name(),
            nr_cpus = nr,
            sched = sched.name(),
            "booting simulator"
        );

        let mut sim = Simulator {
            ctx,
            sched,
            tasks: Vec::new(),
            stop_tasks: Vec::with_capacity(nr),
            groups: GroupRegistry::new(),
            lb: LbTracker::new(),
            nohz: NohzTracker::new(nr),
            options: SimOptions::default(),
            next_pid: 1,
            migrations_disabled: false,
            started: false,
            out: Box::new(io::stdout()),
        };
        for i in 0..nr as u32 {
            let cpu = CpuId(i);
            let id = TaskId::stop(cpu);
            let pid = sim.alloc_pid();
            sim.sched.set_stop_task(&mut sim.ctx, cpu, id);
            sim.stop_tasks.push(SimTask {
                id,
                pid,
                behavior: TaskBehavior::Stop { cpu },
            });
        }
        let now = sim.ctx.now();
        for cpu in sim.ctx.online_cpus().collect::<Vec<_>>() {
            let expires = sim.ctx.next_tick(cpu, now);
            sim.ctx.arm_timer_on(cpu, TimerId::Tick(cpu), expires);
        }
        sim
    }

    pub fn with_options(mut self, options: SimOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> SimOptions {
        self.options
    }

    pub fn set_options(&mut self, options: SimOptions) {
        self.options = options;
    }

    /// Redirect in-loop output (imbalance dumps, scoring notices).
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub(crate) fn emit(&mut self, args: fmt::Arguments<'_>) {
        if let Err(e) = self.out.write_fmt(args) {
            warn!(%e, "failed to write simulator output");
        }
    }

    pub(crate) fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn ctx(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn sched(&self) -> &S {
        &self.sched
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn now(&self) -> TimeNs {
        self.ctx.now()
    }

    /// Number of user tasks created so far.
    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> &[SimTask] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &SimTask {
        match self.tasks.get(id.index()) {
            Some(t) if t.id == id => t,
            _ => panic!("unknown task {id}"),
        }
    }

    pub fn task_info(&self, id: TaskId) -> TaskInfo {
        self.sched.task_info(id)
    }

    /// Run the event loop for `ticks` jiffies.
    pub fn run_ticks(&mut self, ticks: u64) -> RunEnd {
        self.run_ticks_monitored(ticks, &mut NoMonitor)
    }

    /// Run the event loop for `ticks` jiffies, sampling into `monitor`.
    pub fn run_ticks_monitored(&mut self, ticks: u64, monitor: &mut dyn Monitor) -> RunEnd {
        let end = self.ctx.jiffies() + ticks;
        debug!(ticks, end, "run");
        self.started = true;
        let old_cpu = self.ctx.active_cpu();
        for cpu in self.ctx.online_cpus().collect::<Vec<_>>() {
            self.ctx.change_cpu(cpu);
            self.current_handler();
        }
        self.ctx.change_cpu(old_cpu);

        while self.ctx.jiffies() < end {
            if !self.step(monitor) {
                info!(now = self.ctx.now(), "no events pending, halting");
                return RunEnd::NoEvents;
            }
        }
        RunEnd::TicksElapsed
    }

    /// Process one batch of events: every CPU whose next event is the
    /// global minimum. Returns false when nothing is armed anywhere.
    pub fn step(&mut self, monitor: &mut dyn Monitor) -> bool {
        let t = self.ctx.next_event();
        if t == KTIME_MAX {
            return false;
        }
        let due: Vec<CpuId> = self
            .ctx
            .cpus()
            .iter()
            .filter(|c| c.next_event == t)
            .map(|c| c.id)
            .collect();
        self.ctx.advance_clock(t);
        trace!(t, nr_due = due.len(), "event batch");
        self.probe(monitor, ProbePoint::BatchStart, None);
        self.compute_lb_info();

        // Every CPU due at `t` is processed, even if an earlier one of the
        // batch reprogrammed it; it then just finds nothing expired.
        for cpu in due {
            self.fire(cpu, t);
            self.probe(monitor, ProbePoint::Fired, Some(cpu));
            self.post_process(cpu);
            self.probe(monitor, ProbePoint::PostProcessed, Some(cpu));
        }
        true
    }

    fn probe(&self, monitor: &mut dyn Monitor, point: ProbePoint, cpu: Option<CpuId>) {
        monitor.sample(&ProbeContext {
            point,
            cpu,
            time_ns: self.ctx.now(),
            sim: &self.ctx,
            sched: &self.sched,
        });
    }

    /// Run the expired timers of `cpu` in interrupt context.
    fn fire(&mut self, cpu: CpuId, now: TimeNs) {
        self.ctx.cpus[cpu.index()].next_event = KTIME_MAX;
        self.ctx.change_cpu(cpu);
        self.irq_enter(cpu);
        while let Some((id, _)) = self.ctx.timers.pop_expired(cpu, now) {
            if id.is_soft() {
                self.defer_soft_timer(cpu, id);
            } else {
                self.run_timer(id);
            }
        }
        self.irq_exit(cpu);
        self.ctx.reprogram(cpu);
        assert_eq!(
            self.ctx.active_cpu(),
            cpu,
            "timer handlers of cpu {cpu} switched the active cpu"
        );
    }

    fn post_process(&mut self, cpu: CpuId) {
        self.process_all_softirqs();
        assert!(
            !self.ctx.cpu(cpu).irqs_disabled,
            "interrupts still disabled on cpu {cpu} after firing"
        );
        if self.sched.idle_cpu(cpu) && !self.sched.need_resched(cpu) {
            self.enter_nohz(cpu);
        } else {
            self.current_handler();
        }
        self.nohz.track(&self.ctx, cpu);
        if self.options.sanity_check {
            self.run_sanity_check();
        }
    }

    /// Timer callback dispatch.
    pub(crate) fn run_timer(&mut self, id: TimerId) {
        trace!(?id, "timer");
        match id {
            TimerId::Tick(cpu) => {
                self.sched.scheduler_tick(&mut self.ctx);
                let c = self.ctx.cpu(cpu);
                if c.online && !c.nohz_idle {
                    let expires = self.ctx.next_tick(cpu, self.ctx.now());
                    self.ctx.arm_timer_on(cpu, TimerId::Tick(cpu), expires);
                }
            }
            TimerId::Trigger(_) => self.sched.scheduler_ipi(&mut self.ctx),
            TimerId::Task(task) => {
                self.sched.wake_up(&mut self.ctx, task);
            }
            TimerId::Stop(cpu) => {
                self.sched.wake_up(&mut self.ctx, TaskId::stop(cpu));
            }
        }
    }

    /// Run the behavior of whatever is current on the active CPU until the
    /// scheduler settles on one task.
    ///
    /// # Panics
    ///
    /// If the CPU keeps switching tasks past `MAX_RESCHED_ROUNDS`, or a
    /// reschedule is still pending afterwards.
    pub(crate) fn current_handler(&mut self) {
        let cpu = self.ctx.active_cpu();
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(
                rounds <= MAX_RESCHED_ROUNDS,
                "cpu {cpu} did not settle on a task after {rounds} rounds"
            );
            let old = self.sched.curr(cpu);
            if let Some(task) = old {
                self.run_behavior(cpu, task);
            }
            self.check_resched(cpu);
            if self.sched.curr(cpu) == old {
                break;
            }
        }
        assert!(
            !self.sched.need_resched(cpu),
            "reschedule still pending on cpu {cpu}"
        );
    }

    pub(crate) fn check_resched(&mut self, cpu: CpuId) {
        let mut rounds = 0;
        while self.sched.need_resched(cpu) {
            rounds += 1;
            assert!(
                rounds <= MAX_RESCHED_ROUNDS,
                "need_resched never cleared on cpu {cpu}"
            );
            self.check_idle_cpu(cpu);
            self.sched.schedule(&mut self.ctx);
        }
    }

    fn check_idle_cpu(&mut self, cpu: CpuId) {
        if self.ctx.cpu(cpu).nohz_idle && !self.sched.idle_cpu(cpu) {
            self.exit_nohz(cpu);
        }
    }

    fn run_behavior(&mut self, cpu: CpuId, task: TaskId) {
        let Simulator {
            ctx,
            sched,
            tasks,
            stop_tasks,
            ..
        } = self;
        let sim_task = if task.is_stop() {
            &mut stop_tasks[(task.0 - TaskId::STOP_BASE) as usize]
        } else {
            match tasks.get_mut(task.index()) {
                Some(t) => t,
                None => panic!("cpu {cpu} runs unknown task {task}"),
            }
        };
        let mut env = SimEnv { ctx, sched };
        sim_task.behavior.handle(&mut env, task);
    }

    /// Stop the periodic tick of an idle CPU.
    pub(crate) fn enter_nohz(&mut self, cpu: CpuId) {
        if self.ctx.cpu(cpu).nohz_idle {
            return;
        }
        trace!(cpu = cpu.0, "tick stopped");
        self.ctx.cpus[cpu.index()].nohz_idle = true;
        self.ctx.cancel_timer(TimerId::Tick(cpu));
    }

    /// Restart the periodic tick.
    pub(crate) fn exit_nohz(&mut self, cpu: CpuId) {
        if !self.ctx.cpu(cpu).nohz_idle {
            return;
        }
        trace!(cpu = cpu.0, "tick restarted");
        self.ctx.cpus[cpu.index()].nohz_idle = false;
        if self.ctx.cpu_online(cpu) {
            let expires = self.ctx.next_tick(cpu, self.ctx.now());
            self.ctx.arm_timer_on(cpu, TimerId::Tick(cpu), expires);
        }
    }
}

/// The engine's side of [`TaskEnv`].
struct SimEnv<'a, S> {
    ctx: &'a mut SimulationContext,
    sched: &'a mut S,
}

impl<S: Scheduler> TaskEnv for SimEnv<'_, S> {
    fn now(&self) -> TimeNs {
        self.ctx.now()
    }

    fn task_info(&self, task: TaskId) -> TaskInfo {
        self.sched.task_info(task)
    }

    fn arm_wakeup(&mut self, task: TaskId, delta: TimeNs) {
        self.ctx.arm_timer(TimerId::Task(task), delta);
    }

    fn sleep(&mut self, task: TaskId, state: TaskState) {
        self.sched.set_state(task, state);
        self.sched.schedule(self.ctx);
    }

    fn run_stop_work(&mut self, cpu: CpuId) {
        if let Some(work) = self.ctx.stop_work[cpu.index()].take() {
            debug!(cpu = cpu.0, ?work, "stop work");
            self.sched.run_stop_work(self.ctx, work);
        }
    }
}
