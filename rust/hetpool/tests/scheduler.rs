// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end placement scenarios.
//!
//! Pools here run unpinned so the scenarios hold on any machine,
//! regardless of how many CPUs it actually has; pinning itself is covered
//! in the pool tests against CPUs known to exist.

use std::ffi::c_void;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use hetpool::flat_spec;
use hetpool::Architecture;
use hetpool::PoolConfig;
use hetpool::Scheduler;
use hetpool::ThreadPool;

fn unpinned(arch: &Architecture, num_threads: usize) -> ThreadPool {
    ThreadPool::with_config(
        arch,
        num_threads,
        PoolConfig {
            pin_workers: false,
            ..Default::default()
        },
    )
    .unwrap()
}

fn nop(_arg: *mut c_void) {}

fn bump(arg: *mut c_void) {
    let counter = unsafe { &*(arg as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
}

fn wait_for(counter: &AtomicUsize, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "tasks did not drain");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// Two PUs of strengths 100000 and 70000, three tasks of weight 1000:
// the first and third land on the strong PU, the second on the weak one.
#[test]
fn test_two_pu_alternation() {
    let arch = Architecture::new(&flat_spec(&[100_000, 70_000])).unwrap();
    let pool = unpinned(&arch, 2);
    let sched = Scheduler::new(&pool, &arch);

    let mut dispatched = vec![];
    for _ in 0..3 {
        dispatched.push(
            sched
                .submit_and_detach(nop, std::ptr::null_mut(), 1000, 0)
                .unwrap(),
        );
    }

    assert_eq!(dispatched, vec![0, 1, 0]);
    assert_eq!(
        sched.work_histories(),
        vec![(0, 2_000_000), (1, 1_428_571)]
    );

    pool.shutdown();
}

// Four equal PUs degrade to lowest-accumulated-work round-robin.
#[test]
fn test_equal_strength_cycles() {
    let arch = Architecture::new(&flat_spec(&[1000, 1000, 1000, 1000])).unwrap();
    let pool = unpinned(&arch, 4);
    let sched = Scheduler::new(&pool, &arch);

    let mut dispatched = vec![];
    for _ in 0..8 {
        dispatched.push(
            sched
                .submit_and_detach(nop, std::ptr::null_mut(), 1, 0)
                .unwrap(),
        );
    }

    assert_eq!(dispatched, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    for (_, work) in sched.work_histories() {
        assert_eq!(work, 2000);
    }

    pool.shutdown();
}

// A 1000x strength gap: the strong PU absorbs 1000 unit-weight tasks
// before the weak one sees its first.
#[test]
fn test_extreme_imbalance() {
    let arch = Architecture::new(&flat_spec(&[1000, 1])).unwrap();
    let pool = unpinned(&arch, 2);
    let sched = Scheduler::new(&pool, &arch);

    let mut dispatched = vec![];
    for _ in 0..1001 {
        dispatched.push(
            sched
                .submit_and_detach(nop, std::ptr::null_mut(), 1, 0)
                .unwrap(),
        );
    }

    assert!(dispatched[..1000].iter().all(|&pu| pu == 0));
    assert_eq!(dispatched[1000], 1);

    pool.shutdown();
}

// Zero weight is free everywhere: the first PU wins and nothing accrues.
#[test]
fn test_zero_weight() {
    let arch = Architecture::new(&flat_spec(&[100, 200])).unwrap();
    let pool = unpinned(&arch, 2);
    let sched = Scheduler::new(&pool, &arch);

    for _ in 0..5 {
        let pu = sched
            .submit_and_detach(nop, std::ptr::null_mut(), 0, 0)
            .unwrap();
        assert_eq!(pu, 0);
    }
    assert_eq!(sched.work_histories(), vec![(0, 0), (1, 0)]);

    pool.shutdown();
}

// A single PU takes everything and its history only grows.
#[test]
fn test_single_pu_monotonic() {
    let arch = Architecture::new(&flat_spec(&[123])).unwrap();
    let pool = unpinned(&arch, 1);
    let sched = Scheduler::new(&pool, &arch);

    let mut last = 0;
    for weight in [5, 1, 40, 0, 7] {
        let pu = sched
            .submit_and_detach(nop, std::ptr::null_mut(), weight, 0)
            .unwrap();
        assert_eq!(pu, 0);
        let (_, work) = sched.work_histories()[0];
        assert!(work >= last);
        last = work;
    }
    assert_eq!(last, (5 + 1 + 40 + 7) * 1000);

    pool.shutdown();
}

// After a burst of long tasks, a short task lands on the queue with the
// least projected backlog.
#[test]
fn test_short_task_follows_projection() {
    let arch = Architecture::new(&flat_spec(&[1000, 900])).unwrap();
    let pool = unpinned(&arch, 2);
    let sched = Scheduler::new(&pool, &arch);

    let first = sched
        .submit_and_detach(nop, std::ptr::null_mut(), 100, 0)
        .unwrap();
    let second = sched
        .submit_and_detach(nop, std::ptr::null_mut(), 100, 0)
        .unwrap();
    assert_eq!((first, second), (0, 1));

    // Histories: 100000 vs 111111. The short task projects cheapest on
    // PU0, the least-loaded queue in normalized terms.
    let short = sched
        .submit_and_detach(nop, std::ptr::null_mut(), 1, 0)
        .unwrap();
    assert_eq!(short, 0);

    pool.shutdown();
}

// The locality island is advisory: identical submissions with different
// islands place identically.
#[test]
fn test_locality_island_ignored() {
    for island in [0, 3, 99] {
        let arch = Architecture::new(&flat_spec(&[100_000, 70_000])).unwrap();
        let pool = unpinned(&arch, 2);
        let sched = Scheduler::new(&pool, &arch);
        let mut dispatched = vec![];
        for _ in 0..3 {
            dispatched.push(
                sched
                    .submit_and_detach(nop, std::ptr::null_mut(), 1000, island)
                    .unwrap(),
            );
        }
        assert_eq!(dispatched, vec![0, 1, 0]);
        pool.shutdown();
    }
}

// Concurrent submitters: every task runs exactly once and the history
// total equals the sum of normalized costs of what was dispatched.
#[test]
fn test_concurrent_submitters_account_exactly() {
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    let strengths = [1000u64, 700, 300];
    let arch = Architecture::new(&flat_spec(&strengths)).unwrap();
    let pool = unpinned(&arch, 3);
    let sched = Scheduler::new(&pool, &arch);
    let counter = AtomicUsize::new(0);

    let per_thread = 5000usize;
    let max_strength = *strengths.iter().max().unwrap();

    let mut placements: Vec<(usize, u64)> = vec![];
    std::thread::scope(|s| {
        let mut handles = vec![];
        for seed in 0..2u64 {
            let sched = &sched;
            let counter = &counter;
            handles.push(s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut local = vec![];
                for _ in 0..per_thread {
                    let weight = rng.gen_range(1..=100u64);
                    let pu = sched
                        .submit_and_detach(
                            bump,
                            counter as *const _ as *mut c_void,
                            weight,
                            0,
                        )
                        .unwrap();
                    local.push((pu, weight));
                }
                local
            }));
        }
        for handle in handles {
            placements.extend(handle.join().unwrap());
        }
    });

    assert_eq!(placements.len(), 2 * per_thread);
    wait_for(&counter, 2 * per_thread);

    let mut expected = vec![0u64; strengths.len()];
    for (pu, weight) in placements {
        let scaled = weight * 1000;
        expected[pu] += ((scaled as u128 * max_strength as u128)
            / strengths[pu] as u128) as u64;
    }
    let histories = sched.work_histories();
    for (index, &(pu_id, work)) in histories.iter().enumerate() {
        assert_eq!(pu_id, index);
        assert_eq!(work, expected[index]);
    }

    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 2 * per_thread);
}

// A pool with fewer queues than the topology has PUs restricts dispatch
// to the PUs it can actually serve.
#[test]
fn test_truncated_pool_coverage() {
    let arch = Architecture::new(&flat_spec(&[100, 200, 300])).unwrap();
    let pool = unpinned(&arch, 1);
    let sched = Scheduler::new(&pool, &arch);

    for _ in 0..4 {
        let pu = sched
            .submit_and_detach(nop, std::ptr::null_mut(), 10, 0)
            .unwrap();
        assert_eq!(pu, 0);
    }
    assert_eq!(sched.work_histories().len(), 1);

    pool.shutdown();
}
