// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host topology discovery.
//!
//! Builds a [`TopologySpec`] for the running machine from sysfs, so that
//! discovered and hand-written topologies go through the same
//! [`Architecture`](crate::Architecture) constructor. Nothing here is
//! required by the runtime; an explicit spec works everywhere, including
//! machines without a populated `/sys`.
//!
//! Isolated strength is taken from the most precise capacity source the
//! machine exposes, probing in order of decreasing fidelity and scaling the
//! raw values so the strongest PU reads 1024. Machines that report nothing
//! useful come out homogeneous at 1024.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Result;
use glob::glob;
use log::warn;
use sscanf::sscanf;

use crate::topology::CacheSpec;
use crate::topology::CoreSpec;
use crate::topology::PuSpec;
use crate::topology::SocketSpec;
use crate::topology::TopologySpec;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";

/// Sources for guessing per-CPU capacity under /sys/devices/system/cpu/cpuX,
/// ordered from the most precise to the least precise.
const CAPACITY_SOURCES: [&str; 5] = [
    "cpufreq/amd_pstate_prefcore_ranking",
    "cpufreq/amd_pstate_highest_perf",
    "acpi_cppc/highest_perf",
    "cpu_capacity",
    "cpufreq/cpuinfo_max_freq",
];

fn read_from_file<T: FromStr>(path: &Path) -> Option<T> {
    let val = std::fs::read_to_string(path).ok()?;
    val.trim().parse::<T>().ok()
}

fn read_cpu_ids() -> Result<Vec<usize>> {
    let mut cpu_ids = vec![];
    let cpu_paths = glob(&format!("{CPU_SYSFS}/cpu[0-9]*"))?;
    for cpu_path in cpu_paths.filter_map(Result::ok) {
        let cpu_str = cpu_path.to_str().unwrap_or("").trim();
        match sscanf!(cpu_str, "/sys/devices/system/cpu/cpu{usize}") {
            Some(val) => cpu_ids.push(val),
            None => {
                bail!("failed to parse cpu ID {}", cpu_str);
            }
        }
    }
    cpu_ids.sort();
    Ok(cpu_ids)
}

/// Find the capacity source to use and the maximum raw value it reports.
/// Returns `None` when no source carries meaningful information.
fn capacity_source(cpu_ids: &[usize]) -> Option<(usize, usize)> {
    for (index, src) in CAPACITY_SOURCES.iter().enumerate() {
        let mut max_rcap = 0;
        let mut distinct = false;
        let mut first = None;
        for &cpu in cpu_ids {
            let path = PathBuf::from(format!("{CPU_SYSFS}/cpu{cpu}/{src}"));
            let rcap = read_from_file::<usize>(&path).unwrap_or(0);
            if rcap == 0 {
                max_rcap = 0;
                break;
            }
            max_rcap = max_rcap.max(rcap);
            match first {
                None => first = Some(rcap),
                Some(f) if f != rcap => distinct = true,
                Some(_) => {}
            }
        }
        if max_rcap == 0 {
            continue;
        }
        // A source that reports the same value everywhere may be a lying
        // driver; keep probing for one that can tell CPUs apart, but fall
        // back to the last uniform source if none can.
        if distinct || index == CAPACITY_SOURCES.len() - 1 {
            return Some((index, max_rcap));
        }
    }

    None
}

/// Cache-sharing key of a cache index directory, if present.
fn cache_key(cpu: usize, index: usize) -> Option<(u8, String)> {
    let base = PathBuf::from(format!("{CPU_SYSFS}/cpu{cpu}/cache/index{index}"));
    let level = read_from_file::<u8>(&base.join("level"))?;
    let shared = std::fs::read_to_string(base.join("shared_cpu_list")).ok()?;
    Some((level, shared.trim().to_string()))
}

/// NUMA node of each CPU, from /sys/devices/system/node. CPUs not claimed
/// by any node directory land on node 0.
fn numa_of_cpus() -> BTreeMap<usize, usize> {
    let mut map = BTreeMap::new();
    let node_paths = match glob("/sys/devices/system/node/node[0-9]*/cpu[0-9]*") {
        Ok(paths) => paths,
        Err(_) => return map,
    };
    for path in node_paths.filter_map(Result::ok) {
        let s = path.to_str().unwrap_or("").trim();
        if let Some((node, cpu)) = sscanf!(s, "/sys/devices/system/node/node{usize}/cpu{usize}") {
            map.insert(cpu, node);
        }
    }
    map
}

/// Discover the host topology from sysfs.
pub fn from_host() -> Result<TopologySpec> {
    let cpu_ids = read_cpu_ids()?;
    if cpu_ids.is_empty() {
        bail!("no CPUs found under {}", CPU_SYSFS);
    }

    let cap = capacity_source(&cpu_ids);
    if cap.is_none() {
        warn!("CPU capacity information is not available under sysfs");
    }

    let numa = numa_of_cpus();

    // package id -> core kernel id -> PUs
    let mut packages: BTreeMap<usize, BTreeMap<usize, Vec<PuSpec>>> = BTreeMap::new();
    // package id -> core kernel id -> cache keys, nearest level first
    let mut core_cache_keys: BTreeMap<(usize, usize), Vec<(u8, String)>> = BTreeMap::new();
    let mut cpu_nodes: BTreeMap<(usize, usize), usize> = BTreeMap::new();

    for &cpu in cpu_ids.iter() {
        let top = PathBuf::from(format!("{CPU_SYSFS}/cpu{cpu}/topology"));
        let package_id = read_from_file::<usize>(&top.join("physical_package_id")).unwrap_or(0);
        let core_id = read_from_file::<usize>(&top.join("core_id")).unwrap_or(cpu);

        let strength = match cap {
            Some((src, max_rcap)) => {
                let path = PathBuf::from(format!(
                    "{CPU_SYSFS}/cpu{cpu}/{}",
                    CAPACITY_SOURCES[src]
                ));
                let rcap = read_from_file::<usize>(&path).unwrap_or(max_rcap);
                ((rcap * 1024 / max_rcap) as u64).max(1)
            }
            None => 1024,
        };

        packages
            .entry(package_id)
            .or_default()
            .entry(core_id)
            .or_default()
            .push(PuSpec { id: cpu, strength });

        let keys = core_cache_keys.entry((package_id, core_id)).or_default();
        if keys.is_empty() {
            // index0 is L1d; index2/index3 are the unified L2/L3 where
            // present. L1i (index1) is skipped like everywhere else.
            for index in [0, 2, 3] {
                if let Some(key) = cache_key(cpu, index) {
                    keys.push(key);
                }
            }
        }

        cpu_nodes.insert(
            (package_id, core_id),
            numa.get(&cpu).copied().unwrap_or(0),
        );
    }

    let mut sockets = vec![];
    for (package_id, cores_map) in packages {
        let mut caches = vec![];
        let mut cache_index: BTreeMap<(u8, String), usize> = BTreeMap::new();
        let mut cores = vec![];

        for (core_id, pus) in cores_map {
            let mut chain = vec![];
            for key in core_cache_keys
                .get(&(package_id, core_id))
                .map(|v| v.as_slice())
                .unwrap_or(&[])
            {
                let local = *cache_index.entry(key.clone()).or_insert_with(|| {
                    caches.push(CacheSpec { level: key.0 });
                    caches.len() - 1
                });
                chain.push(local);
            }

            cores.push(CoreSpec {
                numa_node: cpu_nodes.get(&(package_id, core_id)).copied().unwrap_or(0),
                caches: chain,
                pus,
            });
        }

        sockets.push(SocketSpec { caches, cores });
    }

    Ok(TopologySpec { sockets })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only sanity-check discovery where a sysfs CPU tree exists; content
    // varies by machine.
    #[test]
    fn test_from_host() {
        if !Path::new(CPU_SYSFS).exists() {
            return;
        }
        let spec = from_host().unwrap();
        let arch = crate::Architecture::new(&spec).unwrap();
        assert!(arch.num_pus() >= 1);
        assert!(arch.max_pu_strength() >= 1);
        assert!(arch.num_cores() <= arch.num_pus());
    }
}
