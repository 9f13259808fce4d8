//! Monte-Carlo workloads: task groups of randomly-distributed sleep/run
//! tasks described by a small text file.
//!
//! The first line of a workload file is `[ROOT |ONE_GROUP ]<N>`, the
//! number of task groups, optionally placing every task in the root group
//! or in a single `all_tasks` group. Each of the next `N` lines reads
//! `[SLEEP_DIST ][RUN_DIST ]<SHARES>`, where a distribution is one of
//!
//! ```text
//! GAUSSIAN <mu> <sigma>
//! POISSON <mu>
//! EXPONENTIAL <mu>
//! LOGNORMAL <meanlog> <sdlog>
//! ```
//!
//! Missing parameters are drawn at random from fixed ranges, and a
//! missing distribution is picked at random. Every random choice comes
//! from one seeded generator, so a seed, a topology and a workload file
//! reproduce the same run bit for bit.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::cpumask::CpuMask;
use crate::dist::{DistKind, DistParams, LehmerRng, RandDist};
use crate::engine::{SimOptions, Simulator};
use crate::sched::{RefScheduler, Scheduler};
use crate::topology::parse_topology;
use crate::types::{GroupId, TaskId};

pub const MIN_N_TASKS: u32 = 10;
pub const MAX_N_TASKS: u32 = 20;

const GAUSSIAN_MEAN: (f64, f64) = (600_000.0, 800_000.0);
const GAUSSIAN_SD: (f64, f64) = (880_000.0, 900_000.0);
const POISSON_MEAN: (f64, f64) = (600_000.0, 800_000.0);
const EXPONENTIAL_MEAN: (f64, f64) = (600_000.0, 700_000.0);
const LOGNORMAL_MEANLOG: (f64, f64) = (11.0, 14.0);
const LOGNORMAL_SDLOG: (f64, f64) = (1.0, 4.0);

/// Distribution with parameters drawn from the default range of `kind`.
pub fn pick_dist(kind: DistKind, rng: &mut LehmerRng) -> RandDist {
    let params = match kind {
        DistKind::Gaussian => {
            let mu = rng.range(GAUSSIAN_MEAN.0, GAUSSIAN_MEAN.1);
            let sigma = rng.range(GAUSSIAN_SD.0, GAUSSIAN_SD.1);
            DistParams::Gaussian {
                mu: mu as i32,
                sigma: sigma as i32,
            }
        }
        DistKind::Poisson => DistParams::Poisson {
            mu: rng.range(POISSON_MEAN.0, POISSON_MEAN.1) as i32,
        },
        DistKind::Exponential => DistParams::Exponential {
            mu: rng.range(EXPONENTIAL_MEAN.0, EXPONENTIAL_MEAN.1) as i32,
        },
        DistKind::Lognormal => {
            let meanlog = rng.range(LOGNORMAL_MEANLOG.0, LOGNORMAL_MEANLOG.1);
            let sdlog = rng.range(LOGNORMAL_SDLOG.0, LOGNORMAL_SDLOG.1);
            DistParams::Lognormal { meanlog, sdlog }
        }
    };
    params.instantiate(rng.state())
}

fn pick_dist_kind(rng: &mut LehmerRng) -> DistKind {
    let n = DistKind::ALL.len();
    DistKind::ALL[(rng.range(0.0, n as f64) as usize).min(n - 1)]
}

/// Run lengths default to lognormal.
pub fn pick_random_run_dist(rng: &mut LehmerRng) -> RandDist {
    pick_dist(DistKind::Lognormal, rng)
}

/// Sleep lengths default to exponential or lognormal.
pub fn pick_random_sleep_dist(rng: &mut LehmerRng) -> RandDist {
    let mut kind = pick_dist_kind(rng);
    while !matches!(kind, DistKind::Exponential | DistKind::Lognormal) {
        kind = pick_dist_kind(rng);
    }
    pick_dist(kind, rng)
}

pub fn pick_n_tasks(rng: &mut LehmerRng) -> u32 {
    rng.range(MIN_N_TASKS as f64, MAX_N_TASKS as f64) as u32
}

/// Strip `prefix` off the front of `line`.
fn eat(line: &mut &str, prefix: &str) -> bool {
    match line.strip_prefix(prefix) {
        Some(rest) => {
            *line = rest;
            true
        }
        None => false,
    }
}

/// A number followed by a single space, consumed together.
fn parse_double(line: &mut &str) -> Option<f64> {
    let s = line.trim_start();
    let end = s.find(char::is_whitespace)?;
    if !s[end..].starts_with(' ') {
        return None;
    }
    let v = s[..end].parse::<f64>().ok()?;
    *line = &s[end + 1..];
    Some(v)
}

/// `strtoul` with base detection: `0x` hex, leading `0` octal, else
/// decimal. Reads as many digits as it can; no digits read as 0.
pub fn parse_ulong(s: &str) -> u64 {
    let s = s.trim_start();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    digits
        .chars()
        .map_while(|c| c.to_digit(radix))
        .fold(0u64, |acc, d| acc.wrapping_mul(radix as u64).wrapping_add(d as u64))
}

/// Parse one optional distribution off the front of `line`.
///
/// The generator is advanced once per call, distribution or not, so
/// identical lines do not produce identically-seeded distributions.
/// Parameters that do not parse are drawn at random, and the line is
/// then left where the keyword ended.
pub fn parse_distribution(line: &mut &str, rng: &mut LehmerRng) -> Option<RandDist> {
    let kind = DistKind::ALL
        .into_iter()
        .find(|k| eat(line, &format!("{} ", k.keyword())));
    rng.next_f64();
    let kind = kind?;

    let mut rest = *line;
    let params = match kind {
        DistKind::Gaussian | DistKind::Lognormal => {
            match (parse_double(&mut rest), parse_double(&mut rest)) {
                (Some(a), Some(b)) if kind == DistKind::Gaussian => Some(DistParams::Gaussian {
                    mu: a as i32,
                    sigma: b as i32,
                }),
                (Some(meanlog), Some(sdlog)) => Some(DistParams::Lognormal { meanlog, sdlog }),
                _ => None,
            }
        }
        DistKind::Poisson => parse_double(&mut rest).map(|mu| DistParams::Poisson { mu: mu as i32 }),
        DistKind::Exponential => {
            parse_double(&mut rest).map(|mu| DistParams::Exponential { mu: mu as i32 })
        }
    };

    match params {
        Some(params) => {
            *line = rest;
            Some(params.instantiate(rng.state()))
        }
        None => Some(pick_dist(kind, rng)),
    }
}

/// One task group of random-distribution tasks.
#[derive(Debug, Clone)]
pub struct TaskGroupSim {
    pub group: GroupId,
    pub shares: u64,
    pub tasks: Vec<TaskId>,
}

/// Create a group (or use `group`) with `shares` and a random number of
/// tasks restricted to `cpus`.
///
/// The first task copies `sleep`/`busy` when given and picks random ones
/// otherwise; every later task copies the distributions of the one
/// before it.
pub fn create_tg_sim<S: Scheduler>(
    sim: &mut Simulator<S>,
    shares: u64,
    sleep: Option<RandDist>,
    busy: Option<RandDist>,
    rng: &mut LehmerRng,
    group: Option<GroupId>,
    cpus: &CpuMask,
) -> TaskGroupSim {
    let n_tasks = pick_n_tasks(rng);
    let group = group.unwrap_or_else(|| sim.create_cgroup(GroupId::ROOT, None));
    sim.set_group_shares(group, shares);

    let mut sleep_params = sleep.map(|d| d.params());
    let mut busy_params = busy.map(|d| d.params());
    let mut tasks = Vec::with_capacity(n_tasks as usize);
    for _ in 0..n_tasks {
        let sleep = match sleep_params {
            Some(p) => p.reseed(rng),
            None => pick_random_sleep_dist(rng),
        };
        let busy = match busy_params {
            Some(p) => p.reseed(rng),
            None => pick_random_run_dist(rng),
        };
        sleep_params = Some(sleep.params());
        busy_params = Some(busy.params());

        let id = sim.create_random_task(sleep, busy);
        sim.set_cpus_allowed(id, cpus);
        sim.add_task_to_group(id, group);
        tasks.push(id);
    }
    debug!(group = group.0, shares, nr_tasks = n_tasks, "created task group");

    TaskGroupSim {
        group,
        shares,
        tasks,
    }
}

/// All task groups created from one workload.
#[derive(Debug, Clone, Default)]
pub struct McarloSim {
    pub groups: Vec<TaskGroupSim>,
}

impl McarloSim {
    /// Parse `text` and create its task groups in `sim`.
    pub fn parse<S: Scheduler>(
        sim: &mut Simulator<S>,
        text: &str,
        cpus: &CpuMask,
        rng: &mut LehmerRng,
    ) -> Result<McarloSim> {
        let mut lines = text.lines();
        let mut first = lines.next().context("workload is empty")?;

        let fixed = if eat(&mut first, "ROOT ") {
            Some(GroupId::ROOT)
        } else if eat(&mut first, "ONE_GROUP ") {
            Some(sim.create_cgroup(GroupId::ROOT, Some("all_tasks")))
        } else {
            None
        };
        let n_groups = parse_ulong(first) as usize;
        if n_groups == 0 {
            bail!("workload declares no task groups: {:?}", first.trim());
        }

        let mut groups = Vec::with_capacity(n_groups);
        for (i, mut line) in lines.take(n_groups).enumerate() {
            let sleep = parse_distribution(&mut line, rng);
            let busy = parse_distribution(&mut line, rng);
            let shares = parse_ulong(line);
            if shares == 0 {
                bail!("task group {} has no shares: {:?}", i + 1, line.trim());
            }
            groups.push(create_tg_sim(sim, shares, sleep, busy, rng, fixed, cpus));
        }
        if groups.len() < n_groups {
            bail!(
                "workload declares {} task groups but describes {}",
                n_groups,
                groups.len()
            );
        }
        Ok(McarloSim { groups })
    }

    pub fn from_file<S: Scheduler>(
        sim: &mut Simulator<S>,
        path: &Path,
        cpus: &CpuMask,
        rng: &mut LehmerRng,
    ) -> Result<McarloSim> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workload {}", path.display()))?;
        Self::parse(sim, &text, cpus, rng)
            .with_context(|| format!("Failed to parse workload {}", path.display()))
    }

    pub fn nr_tasks(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    /// Task and group statistics followed by every task's distributions.
    pub fn print_report<S: Scheduler>(&self, sim: &Simulator<S>, w: &mut dyn Write) -> io::Result<()> {
        sim.print_task_stats(w)?;
        sim.print_group_stats(w)?;
        for tg in &self.groups {
            let path = sim.groups().path(tg.group);
            for &id in &tg.tasks {
                let Some((sleep, busy)) = sim.task(id).behavior.distributions() else {
                    continue;
                };
                write!(w, "\nCGroup = {path}, Task Id = {} sleep_dist: {sleep}", id.0)?;
                write!(w, "\nCGroup = {path}, Task Id = {} busy_dist : {busy}", id.0)?;
            }
        }
        writeln!(w)
    }
}

/// Everything a Monte-Carlo run needs.
#[derive(Debug, Clone)]
pub struct McarloConfig {
    pub topology: String,
    pub workload: PathBuf,
    pub ticks: u64,
    pub seed: u32,
    /// CPUs the workload may use.
    pub cpus: CpuMask,
    /// CPUs kept apart from the workload in their own domain partition.
    pub monitor_cpus: CpuMask,
}

impl McarloConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ticks == 0 {
            bail!("simulation duration must be at least one tick");
        }
        if self.cpus.intersects(&self.monitor_cpus) {
            bail!(
                "workload cpus {} and monitor cpus {} overlap",
                self.cpus.to_cpulist(),
                self.monitor_cpus.to_cpulist()
            );
        }
        Ok(())
    }
}

/// Boot the topology, create the workload and run it.
///
/// When the workload CPUs do not cover every online CPU, the domains are
/// split into the workload CPUs and the monitor CPUs.
pub fn run_mcarlo(
    config: &McarloConfig,
    options: SimOptions,
) -> Result<(Simulator<RefScheduler>, McarloSim)> {
    config.validate()?;
    let topology = parse_topology(&config.topology);
    let mut sim = Simulator::new(topology, RefScheduler::new()).with_options(options);
    let mut rng = LehmerRng::new(config.seed);

    let mcarlo = McarloSim::from_file(&mut sim, &config.workload, &config.cpus, &mut rng)?;

    if !sim.ctx().online_mask().is_subset(&config.cpus) {
        let online = sim.ctx().online_mask();
        sim.partition_sched_domains(vec![
            config.cpus.and(&online),
            config.monitor_cpus.and(&online),
        ]);
    }

    info!(
        seed = config.seed,
        nr_groups = mcarlo.groups.len(),
        nr_tasks = mcarlo.nr_tasks(),
        ticks = config.ticks,
        "starting Monte-Carlo run"
    );
    sim.run_ticks(config.ticks);
    Ok((sim, mcarlo))
}
