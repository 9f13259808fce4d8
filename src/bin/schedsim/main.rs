//! schedsim - Run scheduler simulations: canned balance tests, Monte-Carlo
//! task-group workloads and recorded trace replays.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use scx_schedsim::stats::stat_header;
use scx_schedsim::workload::run_mcarlo;
use scx_schedsim::{
    parse_topology, CannedTest, CpuMask, ExpectError, McarloConfig, PidSpec, RefScheduler,
    Scheduler, SimFormat, SimOptions, Simulator, Topology, TopologyKind, TraceReplay, SIM_LOCK,
    TEST_NAMES,
};

/// Run scheduler simulations over canned machine topologies.
#[derive(Parser)]
#[command(name = "schedsim", version)]
struct Cli {
    #[command(flatten)]
    output: OutputArgs,

    #[command(subcommand)]
    command: Command,
}

/// Reports printed after the run, in this order.
#[derive(Args, Debug, Clone, Copy)]
struct OutputArgs {
    /// Print per-task runtime, run delay and switch count.
    #[arg(long, global = true)]
    print_task_stats: bool,

    /// Print per-group runtime.
    #[arg(long, global = true)]
    print_cgroup_stats: bool,

    /// Print per-CPU and per-domain scheduler statistics.
    #[arg(long, global = true)]
    print_sched_stats: bool,

    /// Print per-CPU tickless residency by domain level.
    #[arg(long, global = true)]
    print_nohz_stats: bool,

    /// Print the time-weighted average imbalance score.
    #[arg(long, global = true)]
    print_average_imbalance: bool,

    /// Print the imbalance score after every event batch.
    #[arg(long, global = true, env = "SCHEDSIM_DUMP_IMBALANCE")]
    dump_imbalance: bool,

    /// Print the full task placement before every scored batch.
    #[arg(long, global = true, env = "SCHEDSIM_DUMP_FULL_BALANCE")]
    dump_full_balance: bool,

    /// Print the whole run report as JSON instead of text sections.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a canned load-balancing test, or `test list` to list them.
    Test {
        /// Test name, or `list`.
        name: String,

        /// Topology name.
        topology: Option<String>,

        /// Override the run length in ticks.
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Run a Monte-Carlo task-group workload.
    Mcarlo {
        /// Topology name.
        #[arg(short, long)]
        topology: String,

        /// Workload description file.
        #[arg(short = 'f', long)]
        workload: PathBuf,

        /// Simulation duration in ticks.
        #[arg(short, long)]
        duration: u64,

        /// Seed for the distribution picker. Defaults to the wall clock.
        #[arg(short, long, env = "SCHEDSIM_SEED")]
        seed: Option<u32>,

        /// CPUs the workload may use (hex mask or cpulist).
        #[arg(short, long, value_parser = CpuMask::parse)]
        cpus: Option<CpuMask>,

        /// CPUs kept in their own domain partition (hex mask or cpulist).
        #[arg(short, long, value_parser = CpuMask::parse)]
        monitor_cpus: Option<CpuMask>,
    },

    /// Replay a recorded scheduler trace (from stdin unless --input).
    Replay {
        /// Topology name.
        topology: String,

        /// CPUs excluded from the replay (hex mask or cpulist).
        #[arg(value_parser = CpuMask::parse)]
        monitor_cpus: CpuMask,

        /// Traced tasks as PID[:GROUP[:SHARES]].
        #[arg(required = true)]
        pids: Vec<PidSpec>,

        /// Read the trace from this file.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Replay perf run/sleep logs (`*.rlog`) from a directory.
    PerfReplay {
        /// Directory holding the run logs.
        dir: PathBuf,

        /// Simulation duration in ticks.
        ticks: u64,
    },

    /// List the canned topologies.
    Topologies,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let _lock = SIM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut output = cli.output;
    let options = SimOptions {
        dump_imbalance: output.dump_imbalance,
        dump_full_balance: output.dump_full_balance,
        ..SimOptions::default()
    };

    match &cli.command {
        Command::Test {
            name,
            topology,
            ticks,
        } => {
            if name == "list" {
                for n in TEST_NAMES {
                    writeln!(out, "{n}")?;
                }
                return Ok(());
            }
            let Some(topology) = topology else {
                bail!("usage: schedsim test <NAME> <TOPOLOGY>");
            };
            let mut test = CannedTest::new(name, parse_topology(topology).kind)?;
            if let Some(ticks) = ticks {
                test = test.with_ticks(*ticks);
            }
            let mut sim = test.simulate(options);
            match test.validate(&sim) {
                Ok(exp) => {
                    print_outputs(&mut sim, &output, &mut out)?;
                    if let Some(summary) = exp.summary(test.name) {
                        writeln!(out, "{summary}")?;
                    }
                }
                Err(e) => {
                    out.flush()?;
                    if let Some(e) = e.downcast_ref::<ExpectError>() {
                        eprintln!("{e}");
                        bail!("test {} failed on {}", test.name, test.topology);
                    }
                    return Err(e);
                }
            }
        }

        Command::Mcarlo {
            topology,
            workload,
            duration,
            seed,
            cpus,
            monitor_cpus,
        } => {
            let config = McarloConfig {
                topology: topology.clone(),
                workload: workload.clone(),
                ticks: *duration,
                seed: seed.unwrap_or_else(wall_clock_seed),
                cpus: cpus.clone().unwrap_or_else(CpuMask::all),
                monitor_cpus: monitor_cpus.clone().unwrap_or_default(),
            };
            writeln!(
                out,
                "\nTOPO = {}, tg_file = {}, duration = {}",
                config.topology,
                config.workload.display(),
                config.ticks
            )?;
            out.flush()?;
            let (mut sim, mcarlo) = run_mcarlo(&config, options)?;
            if !output.json {
                mcarlo.print_report(&sim, &mut out)?;
            }
            print_outputs(&mut sim, &output, &mut out)?;
        }

        Command::Replay {
            topology,
            monitor_cpus,
            pids,
            input,
        } => {
            let sim =
                Simulator::new(parse_topology(topology), RefScheduler::new()).with_options(options);
            let mut replay = TraceReplay::new(sim, monitor_cpus, pids)?;
            let events = match input {
                Some(path) => {
                    let file = File::open(path)
                        .with_context(|| format!("Failed to open trace {}", path.display()))?;
                    replay.run(BufReader::new(file))?
                }
                None => replay.run(io::stdin().lock())?,
            };
            tracing::info!(events, "trace replay finished");
            let mut sim = replay.into_sim();
            output.print_average_imbalance = true;
            print_outputs(&mut sim, &output, &mut out)?;
        }

        Command::PerfReplay { dir, ticks } => {
            let topology = Topology::canned(TopologyKind::Uniprocessor);
            let mut sim = Simulator::new(topology, RefScheduler::new()).with_options(options);
            let created = sim
                .create_perf_tasks(dir)
                .with_context(|| format!("Failed to create perf tasks from {}", dir.display()))?;
            if created.is_empty() {
                bail!("no run logs found in {}", dir.display());
            }
            sim.run_ticks(*ticks);
            output.print_task_stats = true;
            output.print_cgroup_stats = true;
            output.print_sched_stats = true;
            print_outputs(&mut sim, &output, &mut out)?;
        }

        Command::Topologies => {
            for kind in TopologyKind::ALL {
                writeln!(out, "{:<24} {} cpus", kind.name(), kind.nr_cpus())?;
            }
        }
    }

    out.flush()?;
    Ok(())
}

/// Print the requested report sections of a finished run.
fn print_outputs<S: Scheduler>(
    sim: &mut Simulator<S>,
    output: &OutputArgs,
    w: &mut dyn Write,
) -> Result<()> {
    if output.json {
        let report = sim.run_report();
        serde_json::to_writer_pretty(&mut *w, &report)?;
        writeln!(w)?;
        return Ok(());
    }

    if output.print_task_stats {
        stat_header(w, "task runtime")?;
        sim.print_task_stats(w)?;
    }
    if output.print_cgroup_stats {
        stat_header(w, "group runtime")?;
        sim.print_group_stats(w)?;
    }
    if output.print_sched_stats {
        stat_header(w, "sched stats")?;
        sim.show_schedstat(w)?;
    }
    if output.print_nohz_stats {
        stat_header(w, "nohz residency")?;
        sim.print_nohz_residency(w)?;
    }
    if output.print_average_imbalance {
        match sim.average_imbalance() {
            Some(imb) => writeln!(w, "average imbalance: {imb:.6}")?,
            None => writeln!(w, "average imbalance: nan")?,
        }
    }
    Ok(())
}

fn wall_clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .with_writer(io::stderr)
        .try_init();
}
