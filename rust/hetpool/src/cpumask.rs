// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU bit masks.
//!
//! A [`Cpumask`] is a fixed-capacity bit vector indexed by CPU id. The
//! topology uses masks to describe the span of sockets and cores, the pool
//! uses them to pin workers, and task slots may carry one as an optional
//! per-task affinity.
//!
//! Unlike masks tied to the booted host, capacity is explicit: a mask built
//! for an eight-PU architecture holds exactly eight bits and rejects ids
//! beyond that.

use std::fmt;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("invalid CPU {} passed, mask holds {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build an empty mask able to hold CPU ids `0..nr_cpu_ids`.
    pub fn new(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Build a mask from a hexadecimal string. The special values `"none"`
    /// and `"all"` select the empty and the full mask respectively.
    pub fn from_str(cpumask: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => {
                return Ok(Self::new(nr_cpu_ids));
            }
            "all" => {
                let mut mask = Self::new(nr_cpu_ids);
                mask.set_all();
                return Ok(mask);
            }
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpu_ids);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                mask.set_cpu(cpu)
                    .with_context(|| format!("cpumask {cpumask} exceeds {nr_cpu_ids} CPU ids"))?;
            }
        }

        Ok(mask)
    }

    /// Build a mask from a kernel-style cpulist such as `"0-3,7"`.
    pub fn from_cpulist(cpulist: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpu_ids);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit. Fails if `cpu` exceeds the mask capacity.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit. Fails if `cpu` exceeds the mask capacity.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test a bit. Ids beyond the mask capacity read as unset.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Number of bits set.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// Capacity of the mask in CPU ids.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Union with another mask. The result takes the larger capacity.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = if self.len() >= other.len() {
            self.clone()
        } else {
            other.clone()
        };
        for cpu in self.iter().chain(other.iter()) {
            new.mask.set(cpu, true);
        }
        new
    }

    /// Iterate over the ids with bits set.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    /// Pin the calling thread to the CPUs in this mask.
    pub fn pin_current_thread(&self) -> Result<()> {
        if self.is_empty() {
            bail!("refusing to pin to an empty cpumask");
        }
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for cpu in self.iter() {
                libc::CPU_SET(cpu, &mut set);
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                bail!(
                    "sched_setaffinity({}) failed: {}",
                    self,
                    std::io::Error::last_os_error()
                );
            }
        }

        Ok(())
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.len().div_ceil(32).max(1));

        let width = match self.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        match case {
            'x' => write!(f, "{:0width$x}", masks.pop().unwrap_or(0), width = width)?,
            'X' => write!(f, "{:0width$X}", masks.pop().unwrap_or(0), width = width)?,
            _ => unreachable!(),
        }

        for submask in masks.iter().rev() {
            match case {
                'x' => write!(f, ",{submask:08x}")?,
                'X' => write!(f, ",{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

/// Parse a kernel-style cpulist (`"0-3,7"`) into the ids it names.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Some((x, y)) => (x, y),
            None => match sscanf!(group.trim(), "{usize}") {
                Some(x) => (x, x),
                None => {
                    bail!("failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_test() {
        let mut mask = Cpumask::new(8);
        assert!(!mask.test_cpu(0));
        mask.set_cpu(0).unwrap();
        mask.set_cpu(5).unwrap();
        assert!(mask.test_cpu(0));
        assert!(mask.test_cpu(5));
        assert_eq!(mask.weight(), 2);
        assert!(mask.set_cpu(8).is_err());
        assert!(!mask.test_cpu(64));
    }

    #[test]
    fn test_from_str() {
        let mask = Cpumask::from_str("0xf0", 8).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(Cpumask::from_str("none", 8).unwrap().weight(), 0);
        assert_eq!(Cpumask::from_str("all", 8).unwrap().weight(), 8);
        assert!(Cpumask::from_str("0x100", 8).is_err());
    }

    #[test]
    fn test_from_cpulist() {
        let mask = Cpumask::from_cpulist("0-2,6", 8).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 6]);
        assert!(Cpumask::from_cpulist("nonsense", 8).is_err());
    }

    #[test]
    fn test_or() {
        let a = Cpumask::from_cpulist("0-1", 4).unwrap();
        let b = Cpumask::from_cpulist("3", 8).unwrap();
        let both = a.or(&b);
        assert_eq!(both.len(), 8);
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
    }
}
