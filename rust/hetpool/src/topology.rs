// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Architecture model.
//!
//! An [`Architecture`] is a read-only description of the machine the pool
//! runs on, built once from a [`TopologySpec`] and never mutated afterwards:
//!
//! ```text
//!                 Architecture
//!                      |
//!      o---------------o---------------o
//!      |    Socket     |    Socket     |
//!      o---------------o---------------o
//!            |
//!      o-----o-----o         Each Core belongs to one Socket and one
//!      |   Core    |   ...   NUMA node and owns its PUs. Caches hang
//!      o-----------o         off Cores as arena indices.
//!            |
//!      o-----o-----o
//!      |    PU     |         id + isolated strength
//!      o-----------o
//! ```
//!
//! Every PU carries an `isolated_strength`, a unitless positive integer
//! describing its relative throughput when nothing else runs. The scheduler
//! normalizes task costs against the maximum strength observed at build
//! time, so the strongest PU is the reference point.
//!
//! Back-references (PU to Core, Core to Socket, cache to cache) are flat
//! arena indices rather than pointers; Sockets own Cores and Cores own PUs,
//! so the ownership graph stays acyclic.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::Cpumask;

pub type PuId = usize;
pub type CacheId = usize;

/// Explicit topology description, the input to [`Architecture::new`].
///
/// Deserializes from JSON, so a topology can live in a file next to the
/// workload that uses it. See [`crate::host`] for building one from sysfs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologySpec {
    pub sockets: Vec<SocketSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketSpec {
    /// Caches at socket scope. Cores refer to them by index into this list.
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    pub cores: Vec<CoreSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheSpec {
    pub level: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreSpec {
    /// NUMA node this core belongs to.
    #[serde(default)]
    pub numa_node: usize,
    /// Cache chain of this core, nearest first (L1, L2, L3), as indices
    /// into the owning socket's `caches`.
    #[serde(default)]
    pub caches: Vec<usize>,
    pub pus: Vec<PuSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PuSpec {
    /// Stable identifier, matching the OS cpuset index used for pinning.
    pub id: PuId,
    /// Relative compute power when running alone. Must be positive.
    pub strength: u64,
}

/// A logical processor, the finest-grained schedulable resource.
#[derive(Debug)]
pub struct Pu {
    id: PuId,
    isolated_strength: u64,
    core_index: usize,
}

impl Pu {
    pub fn id(&self) -> PuId {
        self.id
    }

    /// Power of this PU assuming it is running in isolation.
    pub fn isolated_strength(&self) -> u64 {
        self.isolated_strength
    }

    /// Flat index of the owning core within the Architecture.
    pub fn core_index(&self) -> usize {
        self.core_index
    }
}

/// A physical core. Owns at least one PU.
#[derive(Debug)]
pub struct Core {
    index: usize,
    socket_index: usize,
    numa_node: usize,
    pus: Vec<Arc<Pu>>,
    caches: Vec<CacheId>,
    span: Cpumask,
}

impl Core {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn socket_index(&self) -> usize {
        self.socket_index
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    pub fn pus(&self) -> &[Arc<Pu>] {
        &self.pus
    }

    /// Cache chain of this core, nearest level first.
    pub fn caches(&self) -> &[CacheId] {
        &self.caches
    }

    /// Cpumask of all PU ids on this core.
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

/// A physical package. Owns its cores and the caches at socket scope.
#[derive(Debug)]
pub struct Socket {
    index: usize,
    cores: Vec<Core>,
    span: Cpumask,
}

impl Socket {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

/// One cache in the cache DAG. A cache serves a set of PUs, draws from at
/// most one lower (larger, slower) cache and feeds zero or more higher ones.
#[derive(Debug)]
pub struct Cache {
    id: CacheId,
    level: u8,
    pus: Vec<PuId>,
    lower: Option<CacheId>,
    higher: Vec<CacheId>,
}

impl Cache {
    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// All PUs associated with this cache.
    pub fn associated_pus(&self) -> &[PuId] {
        &self.pus
    }

    /// The next-lower cache, e.g. the L2 behind an L1.
    pub fn lower_cache(&self) -> Option<CacheId> {
        self.lower
    }

    /// The caches which draw from this one.
    pub fn higher_caches(&self) -> &[CacheId] {
        &self.higher
    }
}

/// Root of the topology. Immutable once constructed; unsynchronized reads
/// from any thread are safe.
#[derive(Debug)]
pub struct Architecture {
    sockets: Vec<Socket>,
    caches: Vec<Cache>,
    numa_nodes: Vec<usize>,
    pus: Vec<Arc<Pu>>,
    pu_index: BTreeMap<PuId, usize>,
    num_cores: usize,
    max_pu_strength: u64,
    span: Cpumask,
}

/// Record `lower` as `higher`'s lower cache and insert the back-link. The
/// back-link insertion is idempotent.
fn associate_lower_cache(caches: &mut [Cache], higher: CacheId, lower: CacheId) {
    caches[higher].lower = Some(lower);
    if !caches[lower].higher.contains(&higher) {
        caches[lower].higher.push(higher);
    }
}

impl Architecture {
    /// Build an Architecture from an explicit description.
    ///
    /// Fails when the description names no PUs, when a PU id repeats, when
    /// a strength is zero, or when a core names a cache its socket does not
    /// declare.
    pub fn new(spec: &TopologySpec) -> Result<Architecture> {
        let nr_cpu_ids = spec
            .sockets
            .iter()
            .flat_map(|s| s.cores.iter())
            .flat_map(|c| c.pus.iter())
            .map(|p| p.id + 1)
            .max()
            .unwrap_or(0);
        if nr_cpu_ids == 0 {
            bail!("topology has no PUs");
        }

        let mut sockets = vec![];
        let mut caches: Vec<Cache> = vec![];
        let mut numa_nodes = vec![];
        let mut pus: Vec<Arc<Pu>> = vec![];
        let mut pu_index = BTreeMap::new();
        let mut num_cores = 0;
        let mut span = Cpumask::new(nr_cpu_ids);

        for (socket_index, socket_spec) in spec.sockets.iter().enumerate() {
            let cache_base = caches.len();
            for cache_spec in socket_spec.caches.iter() {
                let id = caches.len();
                caches.push(Cache {
                    id,
                    level: cache_spec.level,
                    pus: vec![],
                    lower: None,
                    higher: vec![],
                });
            }

            let mut cores = vec![];
            let mut socket_span = Cpumask::new(nr_cpu_ids);
            for core_spec in socket_spec.cores.iter() {
                let core_index = num_cores;
                num_cores += 1;

                if core_spec.pus.is_empty() {
                    bail!("core {} on socket {} has no PUs", core_index, socket_index);
                }
                if core_spec.caches.len() > 3 {
                    bail!("core {} names more than three cache levels", core_index);
                }

                let mut core_caches = vec![];
                for &local in core_spec.caches.iter() {
                    if local >= socket_spec.caches.len() {
                        bail!(
                            "core {} references cache {} which socket {} does not declare",
                            core_index,
                            local,
                            socket_index
                        );
                    }
                    core_caches.push(cache_base + local);
                }
                // Chain the levels: L1 draws from L2, L2 from L3.
                for pair in core_caches.windows(2) {
                    associate_lower_cache(&mut caches, pair[0], pair[1]);
                }

                let mut core_pus = vec![];
                let mut core_span = Cpumask::new(nr_cpu_ids);
                for pu_spec in core_spec.pus.iter() {
                    if pu_spec.strength == 0 {
                        bail!("PU {} has zero strength", pu_spec.id);
                    }
                    let pu = Arc::new(Pu {
                        id: pu_spec.id,
                        isolated_strength: pu_spec.strength,
                        core_index,
                    });
                    if pu_index.insert(pu_spec.id, pus.len()).is_some() {
                        bail!("duplicate PU id {}", pu_spec.id);
                    }
                    pus.push(pu.clone());
                    core_pus.push(pu);
                    core_span.set_cpu(pu_spec.id)?;
                    span.set_cpu(pu_spec.id)?;
                    for &cache_id in core_caches.iter() {
                        caches[cache_id].pus.push(pu_spec.id);
                    }
                }
                socket_span = socket_span.or(&core_span);

                if !numa_nodes.contains(&core_spec.numa_node) {
                    numa_nodes.push(core_spec.numa_node);
                }

                cores.push(Core {
                    index: core_index,
                    socket_index,
                    numa_node: core_spec.numa_node,
                    pus: core_pus,
                    caches: core_caches,
                    span: core_span,
                });
            }

            sockets.push(Socket {
                index: socket_index,
                cores,
                span: socket_span,
            });
        }

        let max_pu_strength = pus.iter().map(|p| p.isolated_strength).max().unwrap();

        Ok(Architecture {
            sockets,
            caches,
            numa_nodes,
            pus,
            pu_index,
            num_cores,
            max_pu_strength,
            span,
        })
    }

    /// All PUs, flattened socket by socket, core by core, in insertion
    /// order. Queue and history indices follow this order.
    pub fn pus(&self) -> &[Arc<Pu>] {
        &self.pus
    }

    pub fn num_pus(&self) -> usize {
        self.pus.len()
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Isolated strength of the PU with the given id.
    pub fn pu_strength(&self, pu_id: PuId) -> Result<u64> {
        match self.pu_index.get(&pu_id) {
            Some(&pos) => Ok(self.pus[pos].isolated_strength),
            None => bail!("unknown PU {}", pu_id),
        }
    }

    /// Position of a PU id in [`Self::pus`] order, usable as a queue index.
    pub fn pu_position(&self, pu_id: PuId) -> Option<usize> {
        self.pu_index.get(&pu_id).copied()
    }

    /// Maximum isolated strength across all PUs, recorded at build time.
    pub fn max_pu_strength(&self) -> u64 {
        self.max_pu_strength
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn caches(&self) -> &[Cache] {
        &self.caches
    }

    /// Distinct NUMA node ids, in first-seen order. Modeled but never
    /// consulted for placement.
    pub fn numa_nodes(&self) -> &[usize] {
        &self.numa_nodes
    }

    /// Cpumask of all PU ids in the Architecture.
    pub fn span(&self) -> &Cpumask {
        &self.span
    }
}

/// Shorthand spec for a single socket of single-PU cores with the given
/// strengths, PU ids numbered from zero. The common case in tests and
/// benchmarks.
pub fn flat_spec(strengths: &[u64]) -> TopologySpec {
    TopologySpec {
        sockets: vec![SocketSpec {
            caches: vec![],
            cores: strengths
                .iter()
                .enumerate()
                .map(|(id, &strength)| CoreSpec {
                    numa_node: 0,
                    caches: vec![],
                    pus: vec![PuSpec { id, strength }],
                })
                .collect(),
        }],
    }
}
