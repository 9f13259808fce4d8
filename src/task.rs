//! Task model for the simulator.
//!
//! A simulated task runs no code. Its behavior only decides, each time the
//! task is current on a CPU, whether it keeps running (arming its wakeup
//! timer for the end of the run) or goes to sleep (arming the timer for the
//! end of the sleep). Elapsed run time is derived from the scheduler's own
//! runtime accounting, so calling a behavior twice before its target is
//! reached changes nothing.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::trace;

use crate::dist::RandDist;
use crate::sched::{SchedPolicy, TaskInfo, TaskState};
use crate::types::{msecs, CpuId, Pid, TaskId, TimeNs};

/// What a behavior may do to the machine on behalf of its task.
///
/// The engine implements this over its context and scheduler; tests can
/// implement it with a plain recorder.
pub trait TaskEnv {
    fn now(&self) -> TimeNs;

    fn task_info(&self, task: TaskId) -> TaskInfo;

    /// (Re)arm the task's wakeup timer `delta` ns from now on the active CPU.
    fn arm_wakeup(&mut self, task: TaskId, delta: TimeNs);

    /// Set the task's state and call into the scheduler.
    fn sleep(&mut self, task: TaskId, state: TaskState);

    /// Execute the stop work pending on `cpu`, if any.
    fn run_stop_work(&mut self, cpu: CpuId);
}

/// Run/sleep bookkeeping shared by the sleep/run style behaviors.
#[derive(Debug, Clone, Default)]
pub struct RunTimer {
    /// Runtime at the start of the current run, 0 when no run is active.
    last_start: TimeNs,
}

impl RunTimer {
    /// Runtime as the task sees it. Offset by one so that zero keeps
    /// meaning "no run in progress".
    fn runtime(env: &dyn TaskEnv, task: TaskId) -> TimeNs {
        let info = env.task_info(task);
        let mut runtime = 1 + info.sum_exec_runtime;
        if info.on_rq {
            runtime += env.now().saturating_sub(info.exec_start);
        }
        runtime
    }

    /// Start or continue a run of `ns`. Returns true once the run is
    /// complete; otherwise the wakeup timer is armed for its end.
    pub fn run_for(&mut self, env: &mut dyn TaskEnv, task: TaskId, ns: TimeNs) -> bool {
        let runtime = Self::runtime(env, task);
        let delta = if self.last_start == 0 {
            self.last_start = runtime;
            0
        } else {
            runtime - self.last_start
        };
        if delta >= ns {
            self.last_start = 0;
            return true;
        }
        env.arm_wakeup(task, ns - delta);
        false
    }

    /// Sleep in `state` with a wakeup `ns` from now.
    pub fn sleep_for(&mut self, env: &mut dyn TaskEnv, task: TaskId, state: TaskState, ns: TimeNs) {
        env.arm_wakeup(task, ns);
        env.sleep(task, state);
    }

    pub fn in_run(&self) -> bool {
        self.last_start != 0
    }
}

/// One entry of a recorded run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfEvent {
    Run(TimeNs),
    Sleep(TimeNs),
    /// Uninterruptible wait (I/O).
    IoWait(TimeNs),
}

impl PerfEvent {
    /// Parse an `x,TYPE,x,DURATION` run log line. Durations accept decimal,
    /// `0x` hex and leading-zero octal. Returns `None` for lines without a
    /// duration field.
    pub fn parse(line: &str) -> Option<PerfEvent> {
        let mut fields = line.trim_end().split(',');
        let _ = fields.next()?;
        let kind = fields.next()?;
        let _ = fields.next()?;
        let duration = parse_c_integer(fields.next()?.trim())?;
        Some(if kind.eq_ignore_ascii_case("R") {
            PerfEvent::Run(duration)
        } else if kind.eq_ignore_ascii_case("S") {
            PerfEvent::Sleep(duration)
        } else {
            PerfEvent::IoWait(duration)
        })
    }

    pub fn duration(self) -> TimeNs {
        match self {
            PerfEvent::Run(d) | PerfEvent::Sleep(d) | PerfEvent::IoWait(d) => d,
        }
    }
}

/// Integer with C base detection; trailing garbage ends the number.
fn parse_c_integer(s: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        return if radix == 8 { Some(0) } else { None };
    }
    u64::from_str_radix(&digits[..end], radix).ok()
}

/// Read a run log file. Lines that do not parse end the log.
pub fn read_rlog(path: &Path) -> Result<VecDeque<PerfEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run log {}", path.display()))?;
    Ok(text.lines().map_while(PerfEvent::parse).collect())
}

/// Sleep used once a run log is exhausted.
pub const PERF_END_SLEEP_NS: TimeNs = u32::MAX as TimeNs;

/// How a simulated task spends its time.
pub enum TaskBehavior {
    /// Run `busy_ms`, then sleep `sleep_ms`, forever.
    SleepRun {
        sleep_ms: u64,
        busy_ms: u64,
        timer: RunTimer,
    },
    /// Run and sleep durations (ns) drawn from distributions after each run.
    RandomDist {
        sleep_dist: RandDist,
        busy_dist: RandDist,
        sleep: TimeNs,
        busy: TimeNs,
        timer: RunTimer,
    },
    /// Replay a recorded run log.
    PerfReplay {
        source: PathBuf,
        events: VecDeque<PerfEvent>,
        busy: TimeNs,
        timer: RunTimer,
    },
    /// Per-CPU stop task: run the pending stop work, then sleep.
    Stop { cpu: CpuId },
}

impl fmt::Debug for TaskBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskBehavior::SleepRun { sleep_ms, busy_ms, .. } => f
                .debug_struct("SleepRun")
                .field("sleep_ms", sleep_ms)
                .field("busy_ms", busy_ms)
                .finish(),
            TaskBehavior::RandomDist {
                sleep_dist,
                busy_dist,
                ..
            } => f
                .debug_struct("RandomDist")
                .field("sleep", &sleep_dist.params())
                .field("busy", &busy_dist.params())
                .finish(),
            TaskBehavior::PerfReplay { source, events, .. } => f
                .debug_struct("PerfReplay")
                .field("source", source)
                .field("remaining", &events.len())
                .finish(),
            TaskBehavior::Stop { cpu } => f.debug_struct("Stop").field("cpu", cpu).finish(),
        }
    }
}

impl TaskBehavior {
    pub fn sleep_run(sleep_ms: u64, busy_ms: u64) -> Self {
        TaskBehavior::SleepRun {
            sleep_ms,
            busy_ms,
            timer: RunTimer::default(),
        }
    }

    /// Draws the first run and sleep immediately.
    pub fn random_dist(mut sleep_dist: RandDist, mut busy_dist: RandDist) -> Self {
        let sleep = sleep_dist.sample_ns();
        let busy = busy_dist.sample_ns();
        TaskBehavior::RandomDist {
            sleep_dist,
            busy_dist,
            sleep,
            busy,
            timer: RunTimer::default(),
        }
    }

    /// A replay of `events`. A leading run starts the task busy; a leading
    /// sleep is dropped since the task is not forked yet when it is read.
    pub fn perf_replay(source: PathBuf, mut events: VecDeque<PerfEvent>) -> Self {
        let busy = match events.pop_front() {
            Some(PerfEvent::Run(d)) => d,
            _ => 0,
        };
        TaskBehavior::PerfReplay {
            source,
            events,
            busy,
            timer: RunTimer::default(),
        }
    }

    pub fn perf_replay_file(path: &Path) -> Result<Self> {
        let events = read_rlog(path)?;
        Ok(Self::perf_replay(path.to_path_buf(), events))
    }

    /// Called whenever `task` is current on the active CPU.
    pub fn handle(&mut self, env: &mut dyn TaskEnv, task: TaskId) {
        match self {
            TaskBehavior::SleepRun {
                sleep_ms,
                busy_ms,
                timer,
            } => {
                let busy = msecs(*busy_ms);
                if timer.run_for(env, task, busy) {
                    if *sleep_ms != 0 {
                        timer.sleep_for(env, task, TaskState::Interruptible, msecs(*sleep_ms));
                    } else {
                        timer.run_for(env, task, busy);
                    }
                }
            }
            TaskBehavior::RandomDist {
                sleep_dist,
                busy_dist,
                sleep,
                busy,
                timer,
            } => {
                if timer.run_for(env, task, *busy) {
                    *sleep = sleep_dist.sample_ns().max(1);
                    *busy = busy_dist.sample_ns();
                    trace!(task = task.0, sleep = *sleep, busy = *busy, "next draw");
                    timer.sleep_for(env, task, TaskState::Interruptible, *sleep);
                }
            }
            TaskBehavior::PerfReplay {
                events,
                busy,
                timer,
                ..
            } => {
                if !timer.run_for(env, task, *busy) {
                    return;
                }
                match events.pop_front().filter(|e| e.duration() != 0) {
                    Some(PerfEvent::Run(d)) => {
                        *busy = d;
                        timer.run_for(env, task, d);
                    }
                    Some(PerfEvent::Sleep(d)) => {
                        *busy = 0;
                        timer.sleep_for(env, task, TaskState::Interruptible, d);
                    }
                    Some(PerfEvent::IoWait(d)) => {
                        *busy = 0;
                        timer.sleep_for(env, task, TaskState::Uninterruptible, d);
                    }
                    None => {
                        *busy = 0;
                        timer.sleep_for(env, task, TaskState::Uninterruptible, PERF_END_SLEEP_NS);
                    }
                }
            }
            TaskBehavior::Stop { cpu } => {
                env.run_stop_work(*cpu);
                env.sleep(task, TaskState::Interruptible);
            }
        }
    }

    /// Sleep and run distributions, for random-distribution tasks.
    pub fn distributions(&self) -> Option<(&RandDist, &RandDist)> {
        match self {
            TaskBehavior::RandomDist {
                sleep_dist,
                busy_dist,
                ..
            } => Some((sleep_dist, busy_dist)),
            _ => None,
        }
    }
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub policy: SchedPolicy,
    pub sleep_ms: u64,
    pub busy_ms: u64,
    /// CPUs the task may run on, as a bitmask over the first 64 CPUs.
    pub cpus_allowed: Option<u64>,
}

impl TaskSpec {
    /// A nice-0 normal task alternating `busy_ms` of work and `sleep_ms`
    /// of sleep.
    pub fn sleep_run(sleep_ms: u64, busy_ms: u64) -> Self {
        TaskSpec {
            policy: SchedPolicy::Normal { nice: 0 },
            sleep_ms,
            busy_ms,
            cpus_allowed: None,
        }
    }

    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cpus_allowed(mut self, mask: u64) -> Self {
        self.cpus_allowed = Some(mask);
        self
    }
}

/// A simulated task at runtime.
#[derive(Debug)]
pub struct SimTask {
    pub id: TaskId,
    pub pid: Pid,
    pub behavior: TaskBehavior,
}
