//! End-of-run statistics and reports.
//!
//! Everything here is user-facing output: plain-text listings written to
//! a `Write` sink, and the same data as serializable reports for `--json`.

use std::io::{self, Write};

use serde::Serialize;

use crate::engine::Simulator;
use crate::nohz::NohzReport;
use crate::sched::{CpuSchedStat, DomainSchedStat, Scheduler};
use crate::types::{CpuId, GroupId, TaskId, TimeNs};

/// Schedstat listing format version.
pub const SCHEDSTAT_VERSION: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub pid: i32,
    pub exec_time: TimeNs,
    pub run_delay: TimeNs,
    pub pcount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub id: GroupId,
    pub path: String,
    pub shares: u64,
    /// Runtime of every task in the group or below it.
    pub exec_time: TimeNs,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuReport {
    pub cpu: CpuId,
    pub online: bool,
    pub stat: CpuSchedStat,
    pub domains: Vec<DomainReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    pub level: String,
    pub span: String,
    pub stat: DomainSchedStat,
}

/// Everything a run produced, for machine consumption.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub topology: String,
    pub scheduler: String,
    pub now_ns: TimeNs,
    pub jiffies: u64,
    pub tasks: Vec<TaskReport>,
    pub total_exec_time: TimeNs,
    pub groups: Vec<GroupReport>,
    pub cpus: Vec<CpuReport>,
    pub average_imbalance: Option<f64>,
    pub nohz: NohzReport,
}

/// `------ <name>` separator between report sections.
pub fn stat_header(w: &mut dyn Write, name: &str) -> io::Result<()> {
    writeln!(w, "------ {name}")
}

impl<S: Scheduler> Simulator<S> {
    pub fn task_exec_time(&self, task: TaskId) -> TimeNs {
        self.sched.task_info(task).sum_exec_runtime
    }

    pub fn group_exec_time(&self, group: GroupId) -> TimeNs {
        self.tasks
            .iter()
            .map(|t| self.sched.task_info(t.id))
            .filter(|info| self.groups.is_descendant(info.group, group))
            .map(|info| info.sum_exec_runtime)
            .sum()
    }

    pub fn task_reports(&self) -> Vec<TaskReport> {
        self.tasks
            .iter()
            .map(|t| {
                let info = self.sched.task_info(t.id);
                TaskReport {
                    id: t.id,
                    pid: t.pid.0,
                    exec_time: info.sum_exec_runtime,
                    run_delay: info.run_delay,
                    pcount: info.pcount,
                }
            })
            .collect()
    }

    pub fn group_reports(&self) -> Vec<GroupReport> {
        self.groups
            .iter()
            .map(|g| GroupReport {
                id: g.id,
                path: self.groups.path(g.id),
                shares: g.shares,
                exec_time: self.group_exec_time(g.id),
            })
            .collect()
    }

    pub fn cpu_reports(&self) -> Vec<CpuReport> {
        self.ctx
            .cpus()
            .iter()
            .map(|c| CpuReport {
                cpu: c.id,
                online: c.online,
                stat: self.sched.schedstat(c.id),
                domains: self
                    .ctx
                    .sched_domains(c.id)
                    .iter()
                    .enumerate()
                    .map(|(level, sd)| DomainReport {
                        level: sd.name().to_string(),
                        span: sd.span.to_cpulist(),
                        stat: self.sched.domain_schedstat(c.id, level),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn run_report(&mut self) -> RunReport {
        let tasks = self.task_reports();
        let total_exec_time = tasks.iter().map(|t| t.exec_time).sum();
        let nohz = self.nohz.report(&self.ctx);
        RunReport {
            topology: self.ctx.topology().name().to_string(),
            scheduler: self.sched.name().to_string(),
            now_ns: self.ctx.now(),
            jiffies: self.ctx.jiffies(),
            tasks,
            total_exec_time,
            groups: self.group_reports(),
            cpus: self.cpu_reports(),
            average_imbalance: self.average_imbalance(),
            nohz,
        }
    }

    pub fn print_task_stats(&self, w: &mut dyn Write) -> io::Result<()> {
        let mut total = 0;
        for (i, t) in self.task_reports().iter().enumerate() {
            writeln!(
                w,
                "Task id = {} ({}), exec_time = {}, run_delay = {}, pcount = {}",
                t.pid,
                i + 1,
                t.exec_time,
                t.run_delay,
                t.pcount
            )?;
            total += t.exec_time;
        }
        writeln!(w, "Total exec_time = {total}")
    }

    pub fn print_group_stats(&self, w: &mut dyn Write) -> io::Result<()> {
        for g in self.group_reports() {
            writeln!(w, "CGroup = {} ({}), exec_time = {}", g.path, g.id.0, g.exec_time)?;
        }
        Ok(())
    }

    /// `/proc/schedstat` style listing.
    pub fn show_schedstat(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "version {SCHEDSTAT_VERSION}")?;
        writeln!(w, "timestamp {}", self.ctx.jiffies())?;
        for cpu in self.ctx.online_cpus() {
            let s = self.sched.schedstat(cpu);
            writeln!(
                w,
                "cpu{} {} 0 {} {} {} {} {} {} {}",
                cpu.0,
                s.yld_count,
                s.sched_count,
                s.sched_goidle,
                s.ttwu_count,
                s.ttwu_local,
                s.rq_cpu_time,
                s.run_delay,
                s.pcount
            )?;
            for (level, sd) in self.ctx.sched_domains(cpu).iter().enumerate() {
                let d = self.sched.domain_schedstat(cpu, level);
                writeln!(
                    w,
                    "domain{level} {} {} {} {} {} {} {} {} {} {}",
                    sd.span,
                    d.lb_count,
                    d.lb_balanced,
                    d.lb_failed,
                    d.lb_gained,
                    d.lb_nobusyq,
                    d.idle_lb_count,
                    d.alb_count,
                    d.alb_pushed,
                    d.ttwu_wake_remote
                )?;
            }
        }
        Ok(())
    }

    pub fn print_nohz_residency(&mut self, w: &mut dyn Write) -> io::Result<()> {
        self.nohz.print(&self.ctx, w)
    }
}
