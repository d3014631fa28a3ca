// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::ffi::c_void;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use hetpool::flat_spec;
use hetpool::Architecture;
use hetpool::PoolConfig;
use hetpool::QueueKind;
use hetpool::Scheduler;
use hetpool::ThreadPool;
use hetpool::TopologySpec;
use log::info;
use log::warn;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

/// hetpoolbench: drive the hetpool runtime with synthetic weighted work.
///
/// Builds an Architecture (from a JSON topology file, from sysfs, or a
/// synthetic homogeneous fallback), starts one pinned worker per PU, then
/// pushes spin-loop tasks with seeded random weights through the weighted
/// scheduler. When everything has drained it reports wall time, throughput
/// and the per-PU work histories the scheduler accumulated, which is the
/// quickest way to see the dispatch policy react to a strength imbalance.
#[derive(Debug, Parser)]
struct Opts {
    /// JSON topology description (a serialized TopologySpec). Wins over
    /// --host.
    #[clap(short = 'T', long)]
    topology: Option<PathBuf>,

    /// Discover the topology from /sys instead of using a synthetic one.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    host: bool,

    /// Number of tasks to submit.
    #[clap(short = 'n', long, default_value = "1000")]
    num_tasks: usize,

    /// Worker threads. Defaults to one per PU.
    #[clap(short = 't', long)]
    threads: Option<usize>,

    /// Queue implementation: mutex, spin, sleep or lockfree.
    #[clap(short = 'q', long, default_value = "mutex")]
    queue: QueueKind,

    /// Task weights are drawn uniformly from 1..=max_weight.
    #[clap(short = 'w', long, default_value = "100")]
    max_weight: u64,

    /// Seed for the weight distribution.
    #[clap(short = 's', long, default_value = "42")]
    seed: u64,

    /// Spin-loop iterations per unit of weight.
    #[clap(long, default_value = "10000")]
    spin: u64,

    /// Do not pin workers to PUs. Required when the topology's PU ids are
    /// not valid cpuset indices on this machine.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_pin: bool,

    /// Enable verbose output, including per-dispatch decisions.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

static COMPLETED: AtomicUsize = AtomicUsize::new(0);

struct Work {
    iters: u64,
}

fn spin_task(arg: *mut c_void) {
    let work = unsafe { Box::from_raw(arg as *mut Work) };
    let mut x: u64 = 1;
    for _ in 0..work.iters {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
    }
    std::hint::black_box(x);
    COMPLETED.fetch_add(1, Ordering::Release);
}

fn init_logging(opts: &Opts) -> Result<()> {
    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn load_spec(opts: &Opts) -> Result<TopologySpec> {
    if let Some(path) = &opts.topology {
        let file = File::open(path)
            .with_context(|| format!("failed to open topology file {}", path.display()))?;
        return serde_json::from_reader(file)
            .with_context(|| format!("failed to parse topology file {}", path.display()));
    }

    if opts.host {
        return hetpool::host::from_host();
    }

    let nr_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    info!("no topology given, assuming {} homogeneous PUs", nr_cpus);
    Ok(flat_spec(&vec![1024; nr_cpus]))
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts)?;

    if opts.num_tasks == 0 || opts.max_weight == 0 {
        bail!("need at least one task and a positive weight range");
    }

    let spec = load_spec(&opts)?;
    let arch = Architecture::new(&spec)?;
    info!(
        "topology: {} sockets, {} cores, {} PUs, max strength {}",
        arch.sockets().len(),
        arch.num_cores(),
        arch.num_pus(),
        arch.max_pu_strength()
    );

    let threads = opts.threads.unwrap_or_else(|| arch.num_pus());
    let pool = ThreadPool::with_config(
        &arch,
        threads,
        PoolConfig {
            queue_kind: opts.queue,
            pin_workers: !opts.no_pin,
            ..Default::default()
        },
    )?;
    let sched = Scheduler::new(&pool, &arch);

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let started = Instant::now();
    for _ in 0..opts.num_tasks {
        let weight = rng.gen_range(1..=opts.max_weight);
        let work = Box::into_raw(Box::new(Work {
            iters: weight * opts.spin,
        }));
        sched.submit_and_detach(spin_task, work as *mut c_void, weight, 0)?;
    }
    let submitted = started.elapsed();

    let deadline = Instant::now() + Duration::from_secs(600);
    while COMPLETED.load(Ordering::Acquire) < opts.num_tasks {
        if Instant::now() > deadline {
            warn!(
                "timed out with {} of {} tasks completed",
                COMPLETED.load(Ordering::Acquire),
                opts.num_tasks
            );
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    let elapsed = started.elapsed();

    info!(
        "{} tasks submitted in {:.2?}, drained in {:.2?} ({:.0} tasks/s)",
        opts.num_tasks,
        submitted,
        elapsed,
        opts.num_tasks as f64 / elapsed.as_secs_f64()
    );
    sched.print_work_histories();

    pool.shutdown();
    Ok(())
}
