//! Canned machine topologies and the scheduling-domain hierarchy.
//!
//! A topology maps every CPU to a core, a core group (shared cache) and a
//! NUMA node, plus a node distance table. Scheduling domains are derived
//! from these maps: SMT siblings, core group, node, then the whole
//! partition. Levels whose span would not add anything over the child
//! are dropped, as the kernel does for degenerate domains.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::cpumask::{CpuMask, NR_CPUS};
use crate::types::CpuId;

/// Deepest domain hierarchy tracked per CPU.
pub const MAX_DOMAINS: usize = 10;

/// The built-in machine shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyKind {
    Uniprocessor,
    DualCpu,
    DualCpuMc,
    QuadCpu,
    QuadCpuMc,
    QuadCpuDualSocket,
    QuadCpuQuadSocket,
    HexCpuDualSocketSmt,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 8] = [
        TopologyKind::Uniprocessor,
        TopologyKind::DualCpu,
        TopologyKind::DualCpuMc,
        TopologyKind::QuadCpu,
        TopologyKind::QuadCpuMc,
        TopologyKind::QuadCpuDualSocket,
        TopologyKind::QuadCpuQuadSocket,
        TopologyKind::HexCpuDualSocketSmt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TopologyKind::Uniprocessor => "uniprocessor",
            TopologyKind::DualCpu => "dual_cpu",
            TopologyKind::DualCpuMc => "dual_cpu_mc",
            TopologyKind::QuadCpu => "quad_cpu",
            TopologyKind::QuadCpuMc => "quad_cpu_mc",
            TopologyKind::QuadCpuDualSocket => "quad_cpu_dual_socket",
            TopologyKind::QuadCpuQuadSocket => "quad_cpu_quad_socket",
            TopologyKind::HexCpuDualSocketSmt => "hex_cpu_dual_socket_smt",
        }
    }

    pub fn nr_cpus(self) -> usize {
        match self {
            TopologyKind::Uniprocessor => 1,
            TopologyKind::DualCpu | TopologyKind::DualCpuMc => 2,
            TopologyKind::QuadCpu | TopologyKind::QuadCpuMc => 4,
            TopologyKind::QuadCpuDualSocket => 8,
            TopologyKind::QuadCpuQuadSocket => 16,
            TopologyKind::HexCpuDualSocketSmt => 24,
        }
    }

    pub fn from_name(name: &str) -> Option<TopologyKind> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `(node, coregroup, core)` of CPU `i`.
fn cpu_maps(kind: TopologyKind, i: u32) -> (u32, u32, u32) {
    match kind {
        TopologyKind::Uniprocessor | TopologyKind::DualCpuMc => (0, 0, i),
        TopologyKind::DualCpu | TopologyKind::QuadCpu => (0, i, i),
        TopologyKind::QuadCpuMc => (0, i / 2, i),
        TopologyKind::QuadCpuDualSocket => (0, i % 4, i),
        TopologyKind::QuadCpuQuadSocket => (i / 4, i / 4, i),
        TopologyKind::HexCpuDualSocketSmt => ((i % 12) / 6, (i % 12) / 6, i % 12),
    }
}

/// Static description of a machine.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub kind: TopologyKind,
    pub nr_cpus: usize,
    /// CPU -> NUMA node.
    pub node_map: Vec<u32>,
    /// CPU -> core group (CPUs sharing a last-level cache).
    pub coregroup_map: Vec<u32>,
    /// CPU -> physical core.
    pub core_map: Vec<u32>,
    /// Node x node distance table.
    pub node_distances: Vec<Vec<u32>>,
}

impl Topology {
    pub fn canned(kind: TopologyKind) -> Topology {
        let nr = kind.nr_cpus();
        let maps: Vec<(u32, u32, u32)> = (0..nr as u32).map(|i| cpu_maps(kind, i)).collect();
        let node_distances = match kind {
            TopologyKind::QuadCpuQuadSocket => vec![
                vec![10, 20, 20, 30],
                vec![20, 20, 10, 20],
                vec![20, 10, 20, 20],
                vec![30, 20, 20, 10],
            ],
            TopologyKind::HexCpuDualSocketSmt => vec![vec![10, 20], vec![20, 10]],
            _ => vec![vec![10]],
        };
        Topology {
            kind,
            nr_cpus: nr,
            node_map: maps.iter().map(|m| m.0).collect(),
            coregroup_map: maps.iter().map(|m| m.1).collect(),
            core_map: maps.iter().map(|m| m.2).collect(),
            node_distances,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> {
        (0..self.nr_cpus as u32).map(CpuId)
    }

    /// Whether any physical core carries more than one CPU.
    pub fn has_smt(&self) -> bool {
        let mut cores: Vec<u32> = self.core_map.clone();
        cores.sort_unstable();
        cores.windows(2).any(|w| w[0] == w[1])
    }

    pub fn nr_nodes(&self) -> usize {
        self.node_distances.len()
    }

    pub fn node_distance(&self, a: u32, b: u32) -> u32 {
        self.node_distances[a as usize][b as usize]
    }

    fn siblings(&self, cpu: CpuId, map: &[u32]) -> CpuMask {
        CpuMask::from_cpus(self.cpus().filter(|c| map[c.index()] == map[cpu.index()]))
    }
}

/// Look up a canned topology by name, falling back to a uniprocessor.
pub fn parse_topology(name: &str) -> Topology {
    match TopologyKind::from_name(name) {
        Some(kind) => Topology::canned(kind),
        None => {
            warn!(name, "unknown topology, using uniprocessor");
            Topology::canned(TopologyKind::Uniprocessor)
        }
    }
}

/// Level of a scheduling domain, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DomainLevel {
    Smt,
    Mc,
    Cpu,
    Node,
}

impl DomainLevel {
    pub fn name(self) -> &'static str {
        match self {
            DomainLevel::Smt => "SIBLING",
            DomainLevel::Mc => "MC",
            DomainLevel::Cpu => "CPU",
            DomainLevel::Node => "NODE",
        }
    }

    /// Multiplier applied to the balance interval while the CPU is busy.
    pub fn busy_factor(self) -> u64 {
        match self {
            DomainLevel::Smt => 2,
            _ => 32,
        }
    }
}

/// One level of a CPU's domain hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedDomain {
    pub level: DomainLevel,
    pub span: CpuMask,
    /// Base rebalance interval in jiffies.
    pub balance_interval: u64,
}

impl SchedDomain {
    pub fn name(&self) -> &'static str {
        self.level.name()
    }

    pub fn span_weight(&self) -> usize {
        self.span.weight()
    }

    /// Domain identity: the first CPU in the span.
    pub fn first_cpu(&self) -> Option<CpuId> {
        self.span.first()
    }
}

/// Build every online CPU's domain hierarchy.
///
/// `partitions` splits the online CPUs into disjoint balancing islands.
/// CPUs not covered by any partition get no domains at all. An empty
/// partition list means a single partition of all online CPUs.
pub fn build_sched_domains(
    topo: &Topology,
    online: &CpuMask,
    partitions: &[CpuMask],
) -> Vec<Vec<SchedDomain>> {
    let mut domains = vec![Vec::new(); topo.nr_cpus.min(NR_CPUS)];
    let has_smt = topo.has_smt();
    for cpu in online.iter() {
        let partition = if partitions.is_empty() {
            online.clone()
        } else {
            match partitions.iter().find(|p| p.test(cpu)) {
                Some(p) => p.and(online),
                None => continue,
            }
        };

        let mut candidates = Vec::new();
        if has_smt {
            candidates.push((DomainLevel::Smt, topo.siblings(cpu, &topo.core_map)));
        }
        candidates.push((DomainLevel::Mc, topo.siblings(cpu, &topo.coregroup_map)));
        candidates.push((DomainLevel::Cpu, topo.siblings(cpu, &topo.node_map)));
        candidates.push((DomainLevel::Node, CpuMask::all()));

        let levels = &mut domains[cpu.index()];
        for (level, span) in candidates {
            let span = span.and(&partition);
            if span.weight() <= 1 {
                continue;
            }
            if levels.last().is_some_and(|child: &SchedDomain| child.span == span) {
                continue;
            }
            levels.push(SchedDomain {
                level,
                balance_interval: span.weight() as u64,
                span,
            });
        }
        assert!(levels.len() <= MAX_DOMAINS, "too many domain levels on cpu {cpu}");
    }
    domains
}
