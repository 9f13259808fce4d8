//! Replay of recorded scheduler events.
//!
//! Input is the text output of `perf script -D` over the `sched_wakeup`,
//! `sched_switch` and `sched_migrate_task` tracepoints. Each traced pid is
//! mapped to a simulated task; the trace, not the simulated tasks' own
//! behavior, decides when tasks sleep, wake and move. After every event
//! the placement is scored against the greedy ideal and every online CPU
//! is checked, so the run measures how balanced the recorded machine was.
//!
//! Everything is pinned between events so the scheduler under test cannot
//! move tasks on its own.

use std::collections::HashMap;
use std::io::BufRead;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tracing::{debug, info, trace};

use crate::cpumask::CpuMask;
use crate::engine::Simulator;
use crate::sched::{Scheduler, TaskState};
use crate::task::TaskBehavior;
use crate::types::{CpuId, GroupId, TaskId, NSEC_PER_SEC, NSEC_PER_USEC};

/// A raw sample timestamp within this distance refines the next event's
/// microsecond timestamp.
const SAMPLE_TIME_SLACK_NS: u64 = 1000;

/// Default shares of a group named on the command line.
pub const DEFAULT_SHARES: u64 = 1024;

/// `PID[:GROUP[:SHARES]]`: a traced pid and the group its task goes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidSpec {
    pub pid: i32,
    pub group: Option<String>,
    pub shares: Option<u64>,
}

impl FromStr for PidSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let pid = parts
            .next()
            .unwrap_or_default()
            .parse::<i32>()
            .with_context(|| format!("Invalid pid in {s:?}"))?;
        let group = parts
            .next()
            .map(|g| g.trim_start_matches('/'))
            .filter(|g| !g.is_empty())
            .map(str::to_string);
        if group.as_deref().is_some_and(|g| g.contains('/')) {
            bail!("Only groups directly below the root are supported: {s:?}");
        }
        let shares = parts
            .next()
            .map(|v| v.parse::<u64>().with_context(|| format!("Invalid shares in {s:?}")))
            .transpose()?;
        if parts.next().is_some() {
            bail!("Expected PID[:GROUP[:SHARES]], got {s:?}");
        }
        Ok(PidSpec { pid, group, shares })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// `pid` was woken onto `cpu`.
    Wakeup { pid: i32, cpu: CpuId },
    /// `pid` switched out and went to sleep.
    Sleep { pid: i32 },
    /// `pid` was migrated to `cpu`.
    Migrate { pid: i32, cpu: CpuId },
    /// Any other tracepoint.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub time_ns: u64,
    pub cpu: CpuId,
    pub event: TraceEvent,
}

/// Line parser for `perf script -D` output.
#[derive(Debug)]
pub struct TraceParser {
    timestamp_re: Regex,
    common_re: Regex,
    wakeup_re: Regex,
    switch_re: Regex,
    migrate_re: Regex,
    next_ns: u64,
}

impl TraceParser {
    pub fn new() -> Result<Self> {
        Ok(TraceParser {
            timestamp_re: Regex::new(r"^[0-9]+ ([0-9]+) 0x.*: PERF_RECORD_SAMPLE")?,
            common_re: Regex::new(r"^.* \[([0-9]*)\]  *([0-9]*)\.([0-9]*): ([^:]*): (.*)$")?,
            wakeup_re: Regex::new(r"^comm=.* pid=([0-9]*) .* target_cpu=*([0-9]*)")?,
            switch_re: Regex::new(r"^prev_comm.* prev_pid=([0-9]*) .* prev_state=[^R ]+ ==> next_comm")?,
            migrate_re: Regex::new(r"^comm.* pid=([0-9]*) .* dest_cpu=([0-9]*)")?,
            next_ns: 0,
        })
    }

    /// Parse one line. Lines that carry no event, including switches away
    /// from a still-runnable task, yield `None`.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<TraceRecord>> {
        let line = line.trim_end_matches(['\n', '\r']);

        if let Some(caps) = self.timestamp_re.captures(line) {
            self.next_ns = caps[1].parse().unwrap_or(0);
            return Ok(None);
        }
        let Some(caps) = self.common_re.captures(line) else {
            return Ok(None);
        };

        let cpu = CpuId(caps[1].parse().unwrap_or(0));
        let secs: u64 = parse_digits(&caps[2], line)?;
        let usecs: u64 = parse_digits(&caps[3], line)?;
        let mut time_ns = secs
            .checked_mul(NSEC_PER_SEC)
            .zip(usecs.checked_mul(NSEC_PER_USEC))
            .and_then(|(s, us)| s.checked_add(us))
            .ok_or_else(|| anyhow!("Timestamp out of range in: {line}"))?;
        if self.next_ns > time_ns && self.next_ns - time_ns < SAMPLE_TIME_SLACK_NS {
            time_ns = self.next_ns;
        }
        self.next_ns = 0;

        let tail = &caps[5];
        let event = match &caps[4] {
            "sched_wakeup" => {
                let c = self
                    .wakeup_re
                    .captures(tail)
                    .ok_or_else(|| anyhow!("Malformed sched_wakeup: {line}"))?;
                TraceEvent::Wakeup {
                    pid: parse_field(&c[1], line)?,
                    cpu: CpuId(parse_field(&c[2], line)?),
                }
            }
            "sched_switch" => match self.switch_re.captures(tail) {
                Some(c) => TraceEvent::Sleep {
                    pid: parse_field(&c[1], line)?,
                },
                None => return Ok(None),
            },
            "sched_migrate_task" => {
                let c = self
                    .migrate_re
                    .captures(tail)
                    .ok_or_else(|| anyhow!("Malformed sched_migrate_task: {line}"))?;
                TraceEvent::Migrate {
                    pid: parse_field(&c[1], line)?,
                    cpu: CpuId(parse_field(&c[2], line)?),
                }
            }
            _ => TraceEvent::Other,
        };
        Ok(Some(TraceRecord {
            time_ns,
            cpu,
            event,
        }))
    }
}

/// An optional run of digits; empty reads as zero.
fn parse_digits(field: &str, line: &str) -> Result<u64> {
    if field.is_empty() {
        return Ok(0);
    }
    parse_field(field, line)
}

fn parse_field<T: FromStr>(field: &str, line: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| anyhow!("Failed to parse {field:?} in: {line}"))
}

/// A simulator driven by a recorded trace.
pub struct TraceReplay<S: Scheduler> {
    sim: Simulator<S>,
    parser: TraceParser,
    pids: HashMap<i32, TaskId>,
    nr_events: u64,
}

impl<S: Scheduler> TraceReplay<S> {
    /// Take the monitor CPUs offline and create one sleeping task per
    /// traced pid.
    pub fn new(mut sim: Simulator<S>, monitor_cpus: &CpuMask, pids: &[PidSpec]) -> Result<Self> {
        let possible = sim.ctx().possible_mask();
        if !monitor_cpus.is_subset(&possible) {
            bail!(
                "Monitor cpus {} are not all present in {} (cpus {})",
                monitor_cpus.to_cpulist(),
                sim.ctx().topology().name(),
                possible.to_cpulist()
            );
        }
        if possible.is_subset(monitor_cpus) {
            bail!("Monitor cpus {} leave no cpu to replay on", monitor_cpus.to_cpulist());
        }
        for cpu in monitor_cpus.iter() {
            sim.offline_cpu(cpu);
        }

        let mut map = HashMap::new();
        for spec in pids {
            if map.contains_key(&spec.pid) {
                bail!("pid {} given twice", spec.pid);
            }
            let task = sim.create_normal_task(TaskBehavior::sleep_run(0, 10), 0);
            let group = match &spec.group {
                Some(name) => find_or_create_group(&mut sim, name, spec.shares),
                None => GroupId::ROOT,
            };
            sim.add_task_to_group(task, group);
            sim.replay_sleep(task)?;
            debug!(pid = spec.pid, task = task.0, group = group.0, "traced pid");
            map.insert(spec.pid, task);
        }
        sim.disable_migrations();

        Ok(TraceReplay {
            sim,
            parser: TraceParser::new()?,
            pids: map,
            nr_events: 0,
        })
    }

    /// Apply one line of trace output.
    pub fn feed_line(&mut self, line: &str) -> Result<()> {
        let Some(record) = self.parser.parse_line(line)? else {
            return Ok(());
        };
        let now = self.sim.ctx.clock.set_external(record.time_ns);
        self.sim.ctx.publish();
        trace!(now, cpu = record.cpu.0, event = ?record.event, "trace event");

        let lookup = |pid: i32| self.pids.get(&pid).copied();
        match record.event {
            TraceEvent::Wakeup { pid, cpu } => {
                let Some(task) = lookup(pid) else {
                    return Ok(());
                };
                self.sim.replay_wake(task, cpu)?;
            }
            TraceEvent::Sleep { pid } => {
                let Some(task) = lookup(pid) else {
                    return Ok(());
                };
                self.sim.replay_sleep(task)?;
            }
            TraceEvent::Migrate { pid, cpu } => {
                let Some(task) = lookup(pid) else {
                    return Ok(());
                };
                self.sim.replay_move(task, cpu)?;
            }
            TraceEvent::Other => {}
        }

        self.nr_events += 1;
        self.sim.enable_migrations();
        self.sim.compute_lb_info();
        self.sim.sanity_check_all();
        self.sim.disable_migrations();
        Ok(())
    }

    /// Replay every line of `input`. Returns the number of events scored.
    pub fn run(&mut self, input: impl BufRead) -> Result<u64> {
        for (nr, line) in input.lines().enumerate() {
            let line = line.context("Failed to read trace input")?;
            self.feed_line(&line)
                .with_context(|| format!("trace line {}", nr + 1))?;
        }
        info!(events = self.nr_events, "trace replay finished");
        Ok(self.nr_events)
    }

    pub fn nr_events(&self) -> u64 {
        self.nr_events
    }

    pub fn task_of(&self, pid: i32) -> Option<TaskId> {
        self.pids.get(&pid).copied()
    }

    pub fn sim(&self) -> &Simulator<S> {
        &self.sim
    }

    pub fn into_sim(self) -> Simulator<S> {
        self.sim
    }
}

fn find_or_create_group<S: Scheduler>(sim: &mut Simulator<S>, name: &str, shares: Option<u64>) -> GroupId {
    let group = match sim.groups().find(name) {
        Some(g) => g,
        None => {
            let g = sim.create_cgroup(GroupId::ROOT, Some(name));
            sim.set_group_shares(g, shares.unwrap_or(DEFAULT_SHARES));
            return g;
        }
    };
    if let Some(shares) = shares {
        sim.set_group_shares(group, shares);
    }
    group
}

impl<S: Scheduler> Simulator<S> {
    fn check_replay_cpu(&self, task: TaskId, cpu: CpuId) -> Result<()> {
        if cpu.index() >= self.ctx.nr_cpu_ids() || !self.ctx.cpu_online(cpu) {
            bail!("task {task} sent to cpu {cpu}, which is not an online replay cpu");
        }
        Ok(())
    }

    /// Wake `task` onto `cpu`. A wakeup of a task already queued there is
    /// a spurious timer wakeup and is ignored.
    pub fn replay_wake(&mut self, task: TaskId, cpu: CpuId) -> Result<()> {
        let info = self.sched.task_info(task);
        if info.on_rq && info.cpu == cpu {
            return Ok(());
        }
        if info.on_rq || info.state == TaskState::Running {
            bail!("trace wakes task {task} which is not asleep");
        }
        self.check_replay_cpu(task, cpu)?;
        trace!(task = task.0, from = info.cpu.0, to = cpu.0, "replay wake");

        self.ctx.change_cpu(cpu);
        self.sched.set_cpus_allowed(&mut self.ctx, task, &CpuMask::from_cpu(cpu));
        let woken = self.sched.wake_up(&mut self.ctx, task);
        let info = self.sched.task_info(task);
        assert!(
            woken && info.on_rq && info.state == TaskState::Running,
            "task {task} did not wake up"
        );
        Ok(())
    }

    /// Put `task` to sleep on its CPU, switching it out if it is running.
    pub fn replay_sleep(&mut self, task: TaskId) -> Result<()> {
        let info = self.sched.task_info(task);
        if !info.on_rq || info.state != TaskState::Running {
            bail!("trace puts task {task} to sleep while it is not runnable");
        }
        trace!(task = task.0, cpu = info.cpu.0, "replay sleep");

        self.ctx.change_cpu(info.cpu);
        if self.sched.curr(info.cpu) == Some(task) {
            self.sched.set_state(task, TaskState::Interruptible);
            self.sched.schedule(&mut self.ctx);
        } else {
            self.sched
                .dequeue_sleeping(&mut self.ctx, task, TaskState::Interruptible);
        }
        Ok(())
    }

    /// Move a queued `task` to `cpu`. Sleeping tasks are placed when they
    /// wake instead.
    pub fn replay_move(&mut self, task: TaskId, cpu: CpuId) -> Result<()> {
        let info = self.sched.task_info(task);
        trace!(task = task.0, from = info.cpu.0, to = cpu.0, "replay move");
        if info.on_rq {
            self.check_replay_cpu(task, cpu)?;
            self.force_migration(task, cpu, false);
        }
        Ok(())
    }
}
