// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # hetpool
//!
//! A heterogeneity-aware, topology-bound task execution substrate: a
//! thread pool with one pinned worker and one task queue per processing
//! unit, and a scheduler that steers each submission to the PU expected to
//! finish it first under a shortest-projected-completion-time policy.
//!
//! The pieces compose bottom-up:
//!
//! * [`Architecture`]: an immutable model of sockets, cores and PUs with
//!   per-PU relative strength, built from an explicit [`TopologySpec`] or
//!   discovered from sysfs via [`host::from_host`].
//! * [`ThreadPool`]: N workers pinned to the first N PUs, each draining
//!   its own [`queue`](crate::queue) of pooled task slots.
//! * [`Scheduler`]: weight-driven dispatch over the pool, charging each
//!   PU's history with the normalized cost of what it was handed.
//!
//! ```no_run
//! use hetpool::{flat_spec, Architecture, Scheduler, ThreadPool};
//!
//! fn work(_arg: *mut std::ffi::c_void) {
//!     // task body
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     // Two PUs, one twice as strong as the other.
//!     let arch = Architecture::new(&flat_spec(&[2048, 1024]))?;
//!     let pool = ThreadPool::new(&arch, arch.num_pus())?;
//!     let sched = Scheduler::new(&pool, &arch);
//!
//!     for weight in [4, 4, 1, 9] {
//!         sched.submit_and_detach(work, std::ptr::null_mut(), weight, 0)?;
//!     }
//!     sched.print_work_histories();
//!     pool.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cpumask;
pub mod future;
pub mod host;
pub mod pool;
pub mod queue;
mod task;
pub mod topology;

mod scheduler;

pub use cpumask::Cpumask;
pub use future::TaskFuture;
pub use pool::ExitFn;
pub use pool::PoolConfig;
pub use pool::ThreadPool;
pub use queue::QueueKind;
pub use queue::WorkQueue;
pub use scheduler::Scheduler;
pub use task::TaskFn;
pub use topology::flat_spec;
pub use topology::Architecture;
pub use topology::CacheSpec;
pub use topology::CoreSpec;
pub use topology::PuId;
pub use topology::PuSpec;
pub use topology::SocketSpec;
pub use topology::TopologySpec;
