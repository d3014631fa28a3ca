// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Pinned multi-queue thread pool.
//!
//! The pool spawns one worker per queue and pins worker *i* to the *i*-th
//! PU of the Architecture's flattened PU order, so a submission to queue
//! *i* is a submission to that PU. Workers drain only their own queue;
//! there is no stealing, no re-pinning and no preemption. Within one queue
//! tasks run in submission order, across queues nothing is ordered.
//!
//! Shutdown first publishes the done flag, then invalidates every queue,
//! waits for the workers' availability flags to clear and joins. Pending
//! tasks are abandoned; running bodies finish normally. The done store
//! must be visible before invalidation or a worker could miss the wake,
//! hence release/acquire on the flag.

use std::ffi::c_void;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use log::debug;
use log::error;
use log::warn;

use crate::cpumask::Cpumask;
use crate::future::envelope_trampoline;
use crate::future::Envelope;
use crate::future::TaskFuture;
use crate::queue::QueueKind;
use crate::queue::TaskQueue;
use crate::queue::WorkQueue;
use crate::task::TaskFn;
use crate::task::TaskPool;
use crate::task::TaskSlot;
use crate::topology::Architecture;
use crate::topology::Pu;

/// Round-robin selector for detached submissions with no target PU.
/// Process-scoped on purpose: interleaved submitters spread their load
/// instead of each starting over at queue zero.
static NEXT_QUEUE: AtomicUsize = AtomicUsize::new(0);

/// At-exit callback type, run FIFO during shutdown.
pub type ExitFn = Box<dyn FnOnce() + Send + 'static>;

pub struct PoolConfig {
    /// Queue implementation used for every per-PU queue.
    pub queue_kind: QueueKind,
    /// Allow the pool to grow when backlog exceeds idle capacity.
    pub extendible: bool,
    /// Pin each worker to its PU. Disable for oversubscribed or
    /// containerized runs where the PU ids are not real cpuset indices.
    pub pin_workers: bool,
    /// Callback to run at teardown, after queues are invalidated.
    pub at_exit: Option<ExitFn>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            queue_kind: QueueKind::Mutex,
            extendible: false,
            pin_workers: true,
            at_exit: None,
        }
    }
}

struct Shared {
    queues: Vec<TaskQueue<Arc<TaskSlot>>>,
    tasks: TaskPool,
    availability: RwLock<Vec<Arc<AtomicBool>>>,
    done: AtomicBool,
    pus: Vec<Arc<Pu>>,
    pin_workers: bool,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    extendible: bool,
    extend_lock: Mutex<()>,
    at_exit: crate::queue::MutexQueue<ExitFn>,
}

fn worker_loop(shared: Arc<Shared>, index: usize, avail: Arc<AtomicBool>) {
    if shared.pin_workers {
        let pu = &shared.pus[index % shared.pus.len()];
        let mut mask = Cpumask::new(pu.id() + 1);
        mask.set_cpu(pu.id()).unwrap();
        if let Err(err) = mask.pin_current_thread() {
            error!("worker {}: failed to pin to PU {}: {:#}", index, pu.id(), err);
            std::process::abort();
        }
        debug!("worker {} pinned to PU {}", index, pu.id());
    }

    let queue = &shared.queues[index % shared.queues.len()];
    while !shared.done.load(Ordering::Acquire) {
        avail.store(true, Ordering::Release);
        match queue.wait_pop() {
            Some(slot) => {
                avail.store(false, Ordering::Release);
                slot.execute();
                slot.set_available();
            }
            // Only invalidation wakes a worker empty-handed.
            None => break,
        }
    }
    avail.store(false, Ordering::Release);
}

impl ThreadPool {
    /// Build a pool of `num_threads` pinned workers with default
    /// configuration (mutex queues, fixed size).
    pub fn new(arch: &Architecture, num_threads: usize) -> Result<ThreadPool> {
        Self::with_config(arch, num_threads, PoolConfig::default())
    }

    pub fn with_config(
        arch: &Architecture,
        num_threads: usize,
        config: PoolConfig,
    ) -> Result<ThreadPool> {
        Self::build(arch, num_threads, num_threads, config)
    }

    /// Build a pool whose workers all drain one shared queue. The layout
    /// for oversubscribed runs, where per-worker queues and pinning buy
    /// nothing; combine with [`QueueKind::Sleep`] and `pin_workers: false`
    /// when workers outnumber PUs.
    pub fn with_shared_queue(
        arch: &Architecture,
        num_threads: usize,
        config: PoolConfig,
    ) -> Result<ThreadPool> {
        Self::build(arch, 1, num_threads, config)
    }

    fn build(
        arch: &Architecture,
        num_queues: usize,
        num_threads: usize,
        config: PoolConfig,
    ) -> Result<ThreadPool> {
        if num_threads == 0 {
            bail!("thread pool needs at least one worker");
        }

        let queues = (0..num_queues)
            .map(|_| TaskQueue::new(config.queue_kind))
            .collect();

        let pool = ThreadPool {
            shared: Arc::new(Shared {
                queues,
                tasks: TaskPool::new(),
                availability: RwLock::new(vec![]),
                done: AtomicBool::new(false),
                pus: arch.pus().to_vec(),
                pin_workers: config.pin_workers,
            }),
            threads: Mutex::new(vec![]),
            extendible: config.extendible,
            extend_lock: Mutex::new(()),
            at_exit: crate::queue::MutexQueue::new(),
        };

        if let Some(callback) = config.at_exit {
            pool.append_at_exit(callback);
        }

        pool.new_threads(num_threads)?;

        Ok(pool)
    }

    fn new_threads(&self, count: usize) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        for _ in 0..count {
            let index = threads.len();
            let avail = Arc::new(AtomicBool::new(true));
            self.shared
                .availability
                .write()
                .unwrap()
                .push(avail.clone());

            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("hetpool-worker-{index}"))
                .spawn(move || worker_loop(shared, index, avail))
                .context("failed to spawn worker thread")?;
            threads.push(handle);
        }

        Ok(())
    }

    /// Number of per-PU queues (== the number of initial workers).
    pub fn num_queues(&self) -> usize {
        self.shared.queues.len()
    }

    /// Submit a detached task to the queue of the PU at `pu_index` in
    /// flattened PU order. The argument pointer stays the caller's
    /// responsibility until the task completes.
    pub fn submit_to_pu(&self, func: TaskFn, arg: *mut c_void, pu_index: usize) -> Result<()> {
        if pu_index >= self.shared.queues.len() {
            bail!(
                "PU index {} out of range, pool serves {} queues",
                pu_index,
                self.shared.queues.len()
            );
        }
        if self.shared.done.load(Ordering::Acquire) {
            warn!("submission after shutdown dropped");
            return Ok(());
        }

        let slot = self.shared.tasks.get_task()?;
        slot.set_function(func, arg);
        self.shared.queues[pu_index].push(slot);

        self.expand_pool();

        Ok(())
    }

    /// Submit a detached task with per-task affinity: the executing worker
    /// re-pins itself to `mask` before running the body.
    pub fn submit_to_pu_with_affinity(
        &self,
        func: TaskFn,
        arg: *mut c_void,
        pu_index: usize,
        mask: Cpumask,
    ) -> Result<()> {
        if pu_index >= self.shared.queues.len() {
            bail!(
                "PU index {} out of range, pool serves {} queues",
                pu_index,
                self.shared.queues.len()
            );
        }
        if self.shared.done.load(Ordering::Acquire) {
            warn!("submission after shutdown dropped");
            return Ok(());
        }

        let slot = self.shared.tasks.get_task()?;
        slot.set_function(func, arg);
        slot.set_affinity(mask);
        self.shared.queues[pu_index].push(slot);

        self.expand_pool();

        Ok(())
    }

    /// Submit a detached task to the next queue in round-robin order.
    pub fn submit_and_detach(&self, func: TaskFn, arg: *mut c_void) -> Result<()> {
        let queue = NEXT_QUEUE.fetch_add(1, Ordering::Relaxed) % self.shared.queues.len();
        self.submit_to_pu(func, arg, queue)
    }

    /// Submit a closure and get a [`TaskFuture`] for its result. The
    /// closure is packaged into a pool-owned envelope, so unlike the raw
    /// paths there is no pointer lifetime to manage.
    pub fn submit<F, T>(&self, job: F) -> Result<TaskFuture<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.done.load(Ordering::Acquire) {
            bail!("pool is shut down");
        }

        let (tx, rx) = channel::bounded(1);
        let raw = Envelope::into_raw(Box::new(move || {
            let _ = tx.send(job());
        }));
        match self.submit_and_detach(envelope_trampoline, raw) {
            Ok(()) => Ok(TaskFuture::new(rx)),
            Err(err) => {
                // Reclaim the envelope; it never reached a queue.
                drop(unsafe { Box::from_raw(raw as *mut Envelope) });
                Err(err)
            }
        }
    }

    /// Tasks pushed but not yet popped by a worker, across all queues.
    pub fn num_tasks_waiting(&self) -> u64 {
        self.shared.queues.iter().map(|q| q.len() as u64).sum()
    }

    /// Workers currently blocked waiting for work.
    pub fn num_idle_threads(&self) -> u32 {
        self.shared
            .availability
            .read()
            .unwrap()
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count() as u32
    }

    /// Register code to run at teardown, after queue invalidation.
    /// Callbacks run in registration order.
    pub fn append_at_exit(&self, callback: ExitFn) {
        self.at_exit.push(callback);
    }

    /// Spawn two more workers when the backlog exceeds idle capacity.
    /// Grow-only; workers are never retired before shutdown.
    fn expand_pool(&self) {
        if !self.extendible {
            return;
        }

        if u64::from(self.num_idle_threads()) < self.num_tasks_waiting() {
            let _guard = self.extend_lock.lock().unwrap();
            if let Err(err) = self.new_threads(2) {
                warn!("pool growth failed: {:#}", err);
            }
        }
    }

    /// Stop accepting work, abandon queued tasks, wait for workers to quit
    /// and run the at-exit callbacks. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }

        for queue in self.shared.queues.iter() {
            queue.invalidate();
        }

        // Workers blocked in wait_pop wake empty-handed and clear their
        // flags on the way out; workers mid-task already have them clear.
        loop {
            let all_clear = self
                .shared
                .availability
                .read()
                .unwrap()
                .iter()
                .all(|flag| !flag.load(Ordering::Acquire));
            if all_clear {
                break;
            }
            thread::sleep(Duration::from_micros(100));
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }

        while let Some(callback) = self.at_exit.try_pop() {
            callback();
        }

        self.shared.tasks.release_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
