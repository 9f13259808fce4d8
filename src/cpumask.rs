//! Fixed-width CPU masks.
//!
//! A `CpuMask` is a `BitVec` of u64 words sized for `NR_CPUS`, with the
//! handful of set operations the scheduler and the scoring engine need.
//! Masks print in the kernel's comma-separated 32-bit hex form, e.g.
//! `00000000,0000000f` for CPUs 0-3.

use std::fmt;
use std::ops::{BitAndAssign, BitOrAssign};

use anyhow::{bail, Context, Result};
use bitvec::prelude::*;

use crate::types::CpuId;

/// Compile-time ceiling on the number of simulated CPUs.
pub const NR_CPUS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CpuMask {
    mask: BitVec<u64, Lsb0>,
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuMask {
    /// Build a new empty mask.
    pub fn new() -> CpuMask {
        CpuMask {
            mask: bitvec![u64, Lsb0; 0; NR_CPUS],
        }
    }

    /// Every possible CPU, online or not (the kernel's `CPU_MASK_ALL`).
    pub fn all() -> CpuMask {
        CpuMask {
            mask: bitvec![u64, Lsb0; 1; NR_CPUS],
        }
    }

    /// CPUs `0..nr`.
    pub fn first_n(nr: usize) -> CpuMask {
        let mut mask = CpuMask::new();
        for cpu in 0..nr.min(NR_CPUS) {
            mask.mask.set(cpu, true);
        }
        mask
    }

    pub fn from_cpu(cpu: CpuId) -> CpuMask {
        let mut mask = CpuMask::new();
        mask.set(cpu);
        mask
    }

    pub fn from_cpus(cpus: impl IntoIterator<Item = CpuId>) -> CpuMask {
        let mut mask = CpuMask::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    /// Mask of the first 64 CPUs from a raw word.
    pub fn from_bits(bits: u64) -> CpuMask {
        let mut mask = CpuMask::new();
        mask.mask.as_raw_mut_slice()[0] = bits;
        mask
    }

    /// Parse either a hex mask (`0xf`, `ff`) or a cpulist (`0-3,8`).
    ///
    /// A bare string of decimal digits is read as a cpulist, so `3` means
    /// CPU 3; prefix hex masks with `0x` to disambiguate.
    pub fn parse(s: &str) -> Result<CpuMask> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return Self::from_hex(hex);
        }
        Self::from_cpulist(s)
    }

    /// Build a mask from a hexadecimal string without prefix.
    pub fn from_hex(hex: &str) -> Result<CpuMask> {
        let digits: String = hex.chars().filter(|c| *c != '_' && *c != ',').collect();
        if digits.is_empty() {
            bail!("Failed to parse cpumask: empty string");
        }
        let mut mask = CpuMask::new();
        for (index, ch) in digits.chars().rev().enumerate() {
            let nibble = ch
                .to_digit(16)
                .with_context(|| format!("Failed to parse cpumask: {hex}"))?;
            for bit in 0..4 {
                if nibble & (1 << bit) == 0 {
                    continue;
                }
                let cpu = index * 4 + bit;
                if cpu >= NR_CPUS {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) which is larger than NR_CPUS ({})",
                        cpu,
                        hex,
                        NR_CPUS
                    );
                }
                mask.mask.set(cpu, true);
            }
        }
        Ok(mask)
    }

    pub fn from_cpulist(cpulist: &str) -> Result<CpuMask> {
        let mut mask = CpuMask::new();
        for cpu in read_cpulist(cpulist)? {
            if cpu >= NR_CPUS {
                bail!("Invalid CPU {} passed, max {}", cpu, NR_CPUS - 1);
            }
            mask.mask.set(cpu, true);
        }
        Ok(mask)
    }

    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    pub fn set(&mut self, cpu: CpuId) {
        self.mask.set(cpu.index(), true);
    }

    pub fn clear(&mut self, cpu: CpuId) {
        self.mask.set(cpu.index(), false);
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    pub fn test(&self, cpu: CpuId) -> bool {
        match self.mask.get(cpu.index()) {
            Some(bit) => *bit,
            None => false,
        }
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn first(&self) -> Option<CpuId> {
        self.mask.first_one().map(|i| CpuId(i as u32))
    }

    /// First CPU set in both masks (`cpumask_first_and`).
    pub fn first_and(&self, other: &CpuMask) -> Option<CpuId> {
        self.iter().find(|cpu| other.test(*cpu))
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut new = self.clone();
        new.mask &= &other.mask;
        new
    }

    pub fn or(&self, other: &CpuMask) -> CpuMask {
        let mut new = self.clone();
        new.mask |= &other.mask;
        new
    }

    /// `self & !other`
    pub fn andnot(&self, other: &CpuMask) -> CpuMask {
        let mut new = self.clone();
        for cpu in other.iter() {
            new.clear(cpu);
        }
        new
    }

    pub fn intersects(&self, other: &CpuMask) -> bool {
        self.iter().any(|cpu| other.test(cpu))
    }

    /// Whether every CPU in `self` is also in `other`.
    pub fn is_subset(&self, other: &CpuMask) -> bool {
        self.iter().all(|cpu| other.test(cpu))
    }

    /// Iterate over the CPUs set in the mask, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.mask.iter_ones().map(|i| CpuId(i as u32))
    }

    /// Render as a cpulist (`0-3,8`).
    pub fn to_cpulist(&self) -> String {
        let mut out = Vec::new();
        let cpus: Vec<u32> = self.iter().map(|c| c.0).collect();
        let mut i = 0;
        while i < cpus.len() {
            let start = cpus[i];
            let mut end = start;
            while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
                i += 1;
                end = cpus[i];
            }
            if start == end {
                out.push(format!("{start}"));
            } else {
                out.push(format!("{start}-{end}"));
            }
            i += 1;
        }
        out.join(",")
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let group = group.trim();
        let (min, max) = match group.split_once('-') {
            Some((lo, hi)) => (
                lo.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?,
                hi.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?,
            ),
            None => {
                let x = group
                    .parse::<usize>()
                    .with_context(|| format!("Failed to parse cpulist {group}"))?;
                (x, x)
            }
        };
        if min > max {
            bail!("Failed to parse cpulist {}: descending range", group);
        }
        cpu_ids.extend(min..=max);
    }
    Ok(cpu_ids)
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();
        for (i, submask) in masks.iter().rev().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{submask:08x}")?;
        }
        Ok(())
    }
}

impl BitAndAssign<&Self> for CpuMask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for CpuMask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist_parse() {
        let mask = CpuMask::from_cpulist("0-3,8").unwrap();
        assert_eq!(mask.weight(), 5);
        assert!(mask.test(CpuId(8)));
        assert!(!mask.test(CpuId(4)));
        assert_eq!(mask.to_cpulist(), "0-3,8");
        assert!(CpuMask::from_cpulist("3-1").is_err());
        assert!(CpuMask::from_cpulist("x").is_err());
        assert!(CpuMask::from_cpulist("64").is_err());
    }

    #[test]
    fn test_hex_parse() {
        let mask = CpuMask::parse("0x3").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![CpuId(0), CpuId(1)]);
        let mask = CpuMask::parse("0xf0").unwrap();
        assert_eq!(mask.first(), Some(CpuId(4)));
        assert!(CpuMask::parse("0xzz").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(CpuMask::first_n(4).to_string(), "00000000,0000000f");
        assert_eq!(
            CpuMask::from_cpu(CpuId(32)).to_string(),
            "00000001,00000000"
        );
    }

    #[test]
    fn test_set_ops() {
        let a = CpuMask::from_cpulist("0-3").unwrap();
        let b = CpuMask::from_cpulist("2-5").unwrap();
        assert_eq!(a.and(&b).to_cpulist(), "2-3");
        assert_eq!(a.or(&b).to_cpulist(), "0-5");
        assert_eq!(a.andnot(&b).to_cpulist(), "0-1");
        assert_eq!(a.first_and(&b), Some(CpuId(2)));
        assert!(a.intersects(&b));
        assert!(a.and(&b).is_subset(&a));
        assert!(!a.is_subset(&b));
        assert!(CpuMask::new().is_empty());
        assert_eq!(CpuMask::all().weight(), NR_CPUS);
    }
}
