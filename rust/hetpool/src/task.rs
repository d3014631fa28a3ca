// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Pooled task slots.
//!
//! A task is an opaque function pointer plus an argument pointer. The
//! runtime never interprets, copies or frees the argument; it stays the
//! submitter's property until the task body returns.
//!
//! Slots amortize descriptor allocation: a submission claims the first
//! available slot (or appends a fresh one), the worker that pops it runs
//! the body and marks the slot available again. A slot is therefore always
//! in exactly one of three states: free, claimed-but-queued, or running.
//! Running tasks are never reclaimed; there is no cancellation.

use std::ffi::c_void;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use log::error;

use crate::cpumask::Cpumask;
use crate::queue::SpinLock;

/// The task ABI: one opaque argument, no return value.
pub type TaskFn = fn(*mut c_void);

/// Raw argument pointer, moved across threads without ownership transfer.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);

// Safety: the runtime only carries the pointer; the submitter guarantees
// the pointee outlives the task.
unsafe impl Send for SendPtr {}

struct TaskBody {
    func: Option<TaskFn>,
    arg: SendPtr,
    affinity: Option<Cpumask>,
}

pub struct TaskSlot {
    id: u64,
    /// Set while the slot is free; cleared from claim until completion.
    available: AtomicBool,
    body: SpinLock<TaskBody>,
}

impl TaskSlot {
    fn new(id: u64) -> TaskSlot {
        // Slots are born claimed: the pool hands them straight out.
        TaskSlot {
            id,
            available: AtomicBool::new(false),
            body: SpinLock::new(TaskBody {
                func: None,
                arg: SendPtr(std::ptr::null_mut()),
                affinity: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Claim a free slot. Returns false when the slot is in use.
    fn try_claim(&self) -> bool {
        self.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_function(&self, func: TaskFn, arg: *mut c_void) {
        let mut body = self.body.lock();
        body.func = Some(func);
        body.arg = SendPtr(arg);
        body.affinity = None;
    }

    /// Restrict the thread executing this task to `mask` for the duration
    /// of the body (and, as with cpusets, beyond it).
    pub(crate) fn set_affinity(&self, mask: Cpumask) {
        self.body.lock().affinity = Some(mask);
    }

    /// Run the task body on the calling thread.
    pub(crate) fn execute(&self) {
        let (func, arg, affinity) = {
            let mut body = self.body.lock();
            (body.func.take(), body.arg, body.affinity.take())
        };

        if let Some(mask) = affinity {
            if let Err(err) = mask.pin_current_thread() {
                error!("task {}: failed to apply affinity: {:#}", self.id, err);
                std::process::abort();
            }
        }

        if let Some(func) = func {
            func(arg.0);
        }
    }

    pub(crate) fn set_available(&self) {
        self.available.store(true, Ordering::Release);
    }
}

/// Grow-only pool of task slots.
pub(crate) struct TaskPool {
    slots: SpinLock<Vec<Arc<TaskSlot>>>,
}

impl TaskPool {
    pub(crate) fn new() -> TaskPool {
        TaskPool {
            slots: SpinLock::new(vec![]),
        }
    }

    /// Claim a free slot, appending a new one when every slot is busy.
    /// Allocation failure on growth leaves the pool untouched.
    pub(crate) fn get_task(&self) -> Result<Arc<TaskSlot>> {
        let mut slots = self.slots.lock();
        for slot in slots.iter() {
            if slot.try_claim() {
                return Ok(slot.clone());
            }
        }

        slots
            .try_reserve(1)
            .context("task pool growth failed: out of memory")?;
        let slot = Arc::new(TaskSlot::new(slots.len() as u64));
        slots.push(slot.clone());
        Ok(slot)
    }

    /// Mark every slot available. Shutdown path, after all workers quit.
    pub(crate) fn release_all(&self) {
        for slot in self.slots.lock().iter() {
            slot.set_available();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_reuse() {
        let pool = TaskPool::new();
        let slot = pool.get_task().unwrap();
        assert_eq!(slot.id(), 0);
        assert_eq!(pool.len(), 1);

        // Slot busy: a second request must grow the pool.
        let other = pool.get_task().unwrap();
        assert_eq!(other.id(), 1);
        assert_eq!(pool.len(), 2);

        // Released slots are found again instead of growing.
        slot.set_available();
        let reused = pool.get_task().unwrap();
        assert_eq!(reused.id(), 0);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_execute_runs_once() {
        use std::sync::atomic::AtomicUsize;

        fn bump(arg: *mut c_void) {
            let counter = unsafe { &*(arg as *const AtomicUsize) };
            counter.fetch_add(1, Ordering::SeqCst);
        }

        let counter = AtomicUsize::new(0);
        let pool = TaskPool::new();
        let slot = pool.get_task().unwrap();
        slot.set_function(bump, &counter as *const _ as *mut c_void);
        slot.execute();
        // The body is consumed: re-executing without a new set_function
        // does nothing.
        slot.execute();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_all() {
        let pool = TaskPool::new();
        let a = pool.get_task().unwrap();
        let b = pool.get_task().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        pool.release_all();
        assert_eq!(pool.get_task().unwrap().id(), 0);
    }
}
