// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Weight-driven dispatch.
//!
//! The scheduler places each submission on the PU expected to finish it
//! first. Costs are normalized work units: running a task of raw weight
//! `w` on a PU of isolated strength `s` costs `w * S_max / s`, where
//! `S_max` is the strongest PU's strength, so the strongest PU is the
//! reference and weaker PUs accumulate proportionally more per raw unit.
//!
//! Per PU the scheduler keeps the sum of costs of everything dispatched
//! there. A submission projects that sum plus the new task's cost for
//! every PU and picks the minimum; ties go to the lowest PU index. The
//! find-and-update is one critical section, so concurrent submitters
//! observe a total order on dispatch decisions, and the task is enqueued
//! on exactly the PU whose history was charged.
//!
//! Completions are not fed back: accumulated work only grows. The model
//! projects relative backlog, not wall-clock state.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use log::trace;

use crate::pool::ThreadPool;
use crate::task::TaskFn;
use crate::topology::Architecture;
use crate::topology::Pu;
use crate::topology::PuId;

/// Raw weights are scaled by this before entering the cost model, so
/// integer division keeps distinguishing small weights on PUs whose
/// strengths differ by little.
const WEIGHT_GRANULARITY: u64 = 1000;

struct PuWorkHistory {
    pu: Arc<Pu>,
    /// Normalized work dispatched so far. Monotonically non-decreasing;
    /// saturates at u64::MAX rather than wrapping.
    accumulated_work: u64,
}

pub struct Scheduler<'a> {
    pool: &'a ThreadPool,
    history: Mutex<Vec<PuWorkHistory>>,
    max_pu_strength: u64,
}

/// Cost of raw weight `weight` on a PU of strength `strength`, normalized
/// so the strongest PU is the reference. Computed wide and clamped; with
/// `strength >= 1` the quotient only overflows u64 for weights that are
/// already saturating.
fn normalized_cost(weight: u64, max_pu_strength: u64, strength: u64) -> u64 {
    let wide = (weight as u128 * max_pu_strength as u128) / strength as u128;
    u64::try_from(wide).unwrap_or(u64::MAX)
}

impl<'a> Scheduler<'a> {
    /// Build a scheduler dispatching to `pool` for the PUs of `arch`.
    ///
    /// History entries follow [`Architecture::pus`] order, one per PU the
    /// pool actually serves: a pool with fewer queues than the topology
    /// has PUs restricts dispatch to the PUs that have a queue.
    pub fn new(pool: &'a ThreadPool, arch: &Architecture) -> Scheduler<'a> {
        let covered = arch.num_pus().min(pool.num_queues());
        if covered < arch.num_pus() {
            log::warn!(
                "pool serves {} of {} PUs; dispatch restricted to the first {}",
                covered,
                arch.num_pus(),
                covered
            );
        }

        let history = arch.pus()[..covered]
            .iter()
            .map(|pu| PuWorkHistory {
                pu: pu.clone(),
                accumulated_work: 0,
            })
            .collect();

        Scheduler {
            pool,
            history: Mutex::new(history),
            max_pu_strength: arch.max_pu_strength(),
        }
    }

    /// Pick the PU minimizing projected total work for `weight` and charge
    /// it, in one critical section. Returns `(flat index, PU id)`.
    fn find_best_pu(&self, weight: u64) -> (usize, PuId) {
        let mut history = self.history.lock().unwrap();

        let mut best_index = 0;
        let mut best_pu = history[0].pu.id();
        let mut lowest_work = u64::MAX;

        for (index, entry) in history.iter().enumerate() {
            let cost = normalized_cost(weight, self.max_pu_strength, entry.pu.isolated_strength());
            let total_work = entry.accumulated_work.saturating_add(cost);
            if total_work < lowest_work {
                lowest_work = total_work;
                best_index = index;
                best_pu = entry.pu.id();
            }
        }

        let entry = &mut history[best_index];
        let cost = normalized_cost(weight, self.max_pu_strength, entry.pu.isolated_strength());
        entry.accumulated_work = entry.accumulated_work.saturating_add(cost);

        (best_index, best_pu)
    }

    /// Submit a task for execution on the most appropriate PU.
    ///
    /// `weight` estimates the execution time; unitless, it only needs to
    /// be consistent across submissions. `locality_island` groups tasks
    /// with similar locality; the current policy accepts and ignores it.
    ///
    /// Returns the id of the PU the task was dispatched to.
    pub fn submit_and_detach(
        &self,
        func: TaskFn,
        arg: *mut c_void,
        weight: u64,
        locality_island: usize,
    ) -> Result<PuId> {
        let scaled = weight.saturating_mul(WEIGHT_GRANULARITY);
        let (index, pu_id) = self.find_best_pu(scaled);

        self.pool.submit_to_pu(func, arg, index)?;
        trace!(
            "weight {} (island {}) dispatched to PU {}",
            weight,
            locality_island,
            pu_id
        );

        Ok(pu_id)
    }

    /// Snapshot of `(pu_id, accumulated_work)` in PU order.
    pub fn work_histories(&self) -> Vec<(PuId, u64)> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|entry| (entry.pu.id(), entry.accumulated_work))
            .collect()
    }

    /// Dump the per-PU work histories to stderr, one line per PU.
    pub fn print_work_histories(&self) {
        for (pu_id, work) in self.work_histories() {
            eprintln!("PU #{} : {}", pu_id, work);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_cost() {
        // Strongest PU is the reference: cost == weight.
        assert_eq!(normalized_cost(1_000_000, 100_000, 100_000), 1_000_000);
        // Weaker PUs cost proportionally more, integer-floored.
        assert_eq!(normalized_cost(1_000_000, 100_000, 70_000), 1_428_571);
        // Zero weight is free everywhere.
        assert_eq!(normalized_cost(0, 100_000, 1), 0);
        // Wide arithmetic does not overflow; result clamps.
        assert_eq!(normalized_cost(u64::MAX, u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_granularity_survives_division() {
        // Weight 1 on strengths 3 vs 2 differs only after amplification.
        let w = 1u64 * WEIGHT_GRANULARITY;
        assert_eq!(normalized_cost(w, 3, 3), 1000);
        assert_eq!(normalized_cost(w, 3, 2), 1500);
    }
}
