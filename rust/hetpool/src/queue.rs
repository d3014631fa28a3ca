// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Thread-safe work queues.
//!
//! Four interchangeable FIFO implementations sit behind [`WorkQueue`], with
//! [`TaskQueue`] as the tagged wrapper call sites actually hold, selected by
//! [`QueueKind`] at construction:
//!
//! * [`MutexQueue`]: mutex plus two condvars (not-empty / not-full).
//! * [`SpinQueue`]: spinlock-guarded queue, busy-waiting consumers.
//! * [`SleepQueue`]: mutex-guarded, consumers poll with exponential
//!   backoff; the choice when the machine is oversubscribed.
//! * [`LockFreeQueue`]: bounded channel with a timed blocking dequeue.
//!
//! Within one queue, FIFO order is strict. Invalidation is the shutdown
//! signal: every blocked `wait_pop` returns `None` promptly, and no pop
//! ever succeeds afterwards. Pushing to an invalidated queue is a caller
//! error; the element is silently dropped.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel;
use log::warn;

/// Queue implementation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Mutex,
    Spin,
    Sleep,
    LockFree,
}

impl std::str::FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mutex" => Ok(QueueKind::Mutex),
            "spin" => Ok(QueueKind::Spin),
            "sleep" => Ok(QueueKind::Sleep),
            "lockfree" => Ok(QueueKind::LockFree),
            _ => Err(format!(
                "unknown queue kind {s:?}, expected mutex|spin|sleep|lockfree"
            )),
        }
    }
}

/// The capability set shared by all queue variants.
pub trait WorkQueue<T> {
    /// Append an element. Never blocks on validity; the bounded variant may
    /// wait for capacity.
    fn push(&self, value: T);

    /// Append once the queue holds fewer than `max` elements. Returns false
    /// if the queue was invalidated while waiting.
    fn wait_push(&self, value: T, max: usize) -> bool;

    /// Non-blocking pop. `None` when empty or invalidated.
    fn try_pop(&self) -> Option<T>;

    /// Blocking pop. Returns `None` only once the queue is invalidated.
    fn wait_pop(&self) -> Option<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued elements.
    fn clear(&self);

    /// Mark the queue invalid and wake every blocked consumer. Used to
    /// ensure nothing waits inside `wait_pop` when the pool is exiting.
    fn invalidate(&self);

    fn is_valid(&self) -> bool;
}

/// Minimal test-and-set spinlock, also guarding the task-slot pool.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes all access to `data`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub(crate) struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub(crate) fn new(data: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

struct Fifo<T> {
    queue: VecDeque<T>,
    valid: bool,
}

impl<T> Fifo<T> {
    fn new() -> Fifo<T> {
        Fifo {
            queue: VecDeque::new(),
            valid: true,
        }
    }
}

/// Mutex-and-condvar queue. Consumers sleep on the not-empty condition,
/// bounded producers on the not-full condition.
pub struct MutexQueue<T> {
    inner: Mutex<Fifo<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> MutexQueue<T> {
    pub fn new() -> MutexQueue<T> {
        MutexQueue {
            inner: Mutex::new(Fifo::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }
}

impl<T> Default for MutexQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> for MutexQueue<T> {
    fn push(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(value);
        self.not_empty.notify_one();
    }

    fn wait_push(&self, value: T, max: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.valid && inner.queue.len() >= max {
            inner = self.not_full.wait(inner).unwrap();
        }
        if !inner.valid {
            return false;
        }
        inner.queue.push_back(value);
        self.not_empty.notify_one();
        true
    }

    fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid {
            return None;
        }
        let out = inner.queue.pop_front();
        if out.is_some() {
            self.not_full.notify_one();
        }
        out
    }

    fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.valid && inner.queue.is_empty() {
            inner = self.not_empty.wait(inner).unwrap();
        }
        if !inner.valid {
            return None;
        }
        let out = inner.queue.pop_front();
        self.not_full.notify_one();
        out
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.not_full.notify_all();
    }

    fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid {
            return;
        }
        inner.valid = false;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn is_valid(&self) -> bool {
        self.inner.lock().unwrap().valid
    }
}

/// Spinlock queue. `wait_pop` burns the CPU while empty, which is fine for
/// a worker pinned to an otherwise idle PU and wrong nearly everywhere
/// else.
pub struct SpinQueue<T> {
    inner: SpinLock<Fifo<T>>,
}

impl<T: Send> SpinQueue<T> {
    pub fn new() -> SpinQueue<T> {
        SpinQueue {
            inner: SpinLock::new(Fifo::new()),
        }
    }
}

impl<T: Send> Default for SpinQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkQueue<T> for SpinQueue<T> {
    fn push(&self, value: T) {
        self.inner.lock().queue.push_back(value);
    }

    fn wait_push(&self, value: T, max: usize) -> bool {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.valid {
                    return false;
                }
                if inner.queue.len() < max {
                    inner.queue.push_back(value);
                    return true;
                }
            }
            std::hint::spin_loop();
        }
    }

    fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.valid {
            return None;
        }
        inner.queue.pop_front()
    }

    fn wait_pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.valid {
                    return None;
                }
                if let Some(out) = inner.queue.pop_front() {
                    return Some(out);
                }
            }
            std::hint::spin_loop();
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn clear(&self) {
        self.inner.lock().queue.clear();
    }

    fn invalidate(&self) {
        self.inner.lock().valid = false;
    }

    fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }
}

/// Mutex queue whose consumers poll with exponential backoff instead of
/// sleeping on a condvar: 1us per round, 100us after 100 rounds, 10ms
/// after 1000. Trades wakeup latency for not holding a waiter on the
/// scheduler when workers outnumber PUs.
pub struct SleepQueue<T> {
    inner: Mutex<Fifo<T>>,
    not_full: Condvar,
}

const SLEEP_COARSE_ROUNDS: u32 = 100;
const SLEEP_IDLE_ROUNDS: u32 = 1000;

impl<T> SleepQueue<T> {
    pub fn new() -> SleepQueue<T> {
        SleepQueue {
            inner: Mutex::new(Fifo::new()),
            not_full: Condvar::new(),
        }
    }
}

impl<T> Default for SleepQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> for SleepQueue<T> {
    fn push(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(value);
    }

    fn wait_push(&self, value: T, max: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.valid && inner.queue.len() >= max {
            inner = self.not_full.wait(inner).unwrap();
        }
        if !inner.valid {
            return false;
        }
        inner.queue.push_back(value);
        true
    }

    fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid {
            return None;
        }
        let out = inner.queue.pop_front();
        if out.is_some() {
            self.not_full.notify_one();
        }
        out
    }

    fn wait_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid {
            return None;
        }
        if inner.queue.is_empty() {
            let mut delay = Duration::from_micros(1);
            let mut rounds = 0u32;
            loop {
                drop(inner);
                rounds += 1;
                match rounds {
                    SLEEP_COARSE_ROUNDS => delay = Duration::from_micros(100),
                    SLEEP_IDLE_ROUNDS => delay = Duration::from_millis(10),
                    _ => {}
                }
                std::thread::sleep(delay);
                inner = self.inner.lock().unwrap();
                if !inner.queue.is_empty() || !inner.valid {
                    break;
                }
            }
        }
        if !inner.valid {
            return None;
        }
        let out = inner.queue.pop_front();
        self.not_full.notify_one();
        out
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.not_full.notify_all();
    }

    fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.valid {
            return;
        }
        inner.valid = false;
        self.not_full.notify_all();
    }

    fn is_valid(&self) -> bool {
        self.inner.lock().unwrap().valid
    }
}

/// Bounded channel queue with a timed blocking dequeue. The consumer wakes
/// on its own timeout to observe invalidation.
pub struct LockFreeQueue<T> {
    tx: channel::Sender<T>,
    rx: channel::Receiver<T>,
    valid: AtomicBool,
}

const DEQUEUE_TICK: Duration = Duration::from_millis(100);
const PUSH_RETRY_TICK: Duration = Duration::from_micros(10);

impl<T> LockFreeQueue<T> {
    pub fn new(capacity: usize) -> LockFreeQueue<T> {
        let (tx, rx) = channel::bounded(capacity);
        LockFreeQueue {
            tx,
            rx,
            valid: AtomicBool::new(true),
        }
    }
}

impl<T> WorkQueue<T> for LockFreeQueue<T> {
    fn push(&self, value: T) {
        let mut value = value;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return,
                Err(channel::TrySendError::Full(v)) => {
                    if !self.valid.load(Ordering::Acquire) {
                        warn!("push on a full invalidated queue dropped");
                        return;
                    }
                    value = v;
                    std::thread::sleep(PUSH_RETRY_TICK);
                }
                Err(channel::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn wait_push(&self, value: T, max: usize) -> bool {
        let mut value = value;
        loop {
            if !self.valid.load(Ordering::Acquire) {
                return false;
            }
            if self.rx.len() >= max {
                std::thread::sleep(PUSH_RETRY_TICK);
                continue;
            }
            match self.tx.try_send(value) {
                Ok(()) => return true,
                Err(channel::TrySendError::Full(v)) => {
                    value = v;
                    std::thread::sleep(PUSH_RETRY_TICK);
                }
                Err(channel::TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        if !self.valid.load(Ordering::Acquire) {
            return None;
        }
        self.rx.try_recv().ok()
    }

    fn wait_pop(&self) -> Option<T> {
        loop {
            if !self.valid.load(Ordering::Acquire) {
                return None;
            }
            match self.rx.recv_timeout(DEQUEUE_TICK) {
                Ok(out) => return Some(out),
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// Default capacity of the bounded [`LockFreeQueue`] variant.
const LOCK_FREE_CAPACITY: usize = 64 * 1024;

/// The queue handle the pool holds: one of the four variants, chosen at
/// construction. Call sites dispatch through this enum and never learn
/// which implementation is in use.
pub enum TaskQueue<T: Send> {
    Mutex(MutexQueue<T>),
    Spin(SpinQueue<T>),
    Sleep(SleepQueue<T>),
    LockFree(LockFreeQueue<T>),
}

impl<T: Send> TaskQueue<T> {
    pub fn new(kind: QueueKind) -> TaskQueue<T> {
        match kind {
            QueueKind::Mutex => TaskQueue::Mutex(MutexQueue::new()),
            QueueKind::Spin => TaskQueue::Spin(SpinQueue::new()),
            QueueKind::Sleep => TaskQueue::Sleep(SleepQueue::new()),
            QueueKind::LockFree => TaskQueue::LockFree(LockFreeQueue::new(LOCK_FREE_CAPACITY)),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $q:ident => $body:expr) => {
        match $self {
            TaskQueue::Mutex($q) => $body,
            TaskQueue::Spin($q) => $body,
            TaskQueue::Sleep($q) => $body,
            TaskQueue::LockFree($q) => $body,
        }
    };
}

impl<T: Send> WorkQueue<T> for TaskQueue<T> {
    fn push(&self, value: T) {
        delegate!(self, q => q.push(value))
    }

    fn wait_push(&self, value: T, max: usize) -> bool {
        delegate!(self, q => q.wait_push(value, max))
    }

    fn try_pop(&self) -> Option<T> {
        delegate!(self, q => q.try_pop())
    }

    fn wait_pop(&self) -> Option<T> {
        delegate!(self, q => q.wait_pop())
    }

    fn len(&self) -> usize {
        delegate!(self, q => q.len())
    }

    fn clear(&self) {
        delegate!(self, q => q.clear())
    }

    fn invalidate(&self) {
        delegate!(self, q => q.invalidate())
    }

    fn is_valid(&self) -> bool {
        delegate!(self, q => q.is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const KINDS: [QueueKind; 4] = [
        QueueKind::Mutex,
        QueueKind::Spin,
        QueueKind::Sleep,
        QueueKind::LockFree,
    ];

    #[test]
    fn test_fifo_order() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            for i in 0..100 {
                q.push(i);
            }
            assert_eq!(q.len(), 100);
            for i in 0..100 {
                assert_eq!(q.try_pop(), Some(i), "{kind:?}");
            }
            assert!(q.try_pop().is_none());
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_wait_pop_blocks_until_push() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            thread::scope(|s| {
                let consumer = s.spawn(|| q.wait_pop());
                thread::sleep(Duration::from_millis(10));
                q.push(7);
                assert_eq!(consumer.join().unwrap(), Some(7), "{kind:?}");
            });
        }
    }

    #[test]
    fn test_invalidate_wakes_consumers() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            thread::scope(|s| {
                let consumer = s.spawn(|| q.wait_pop());
                thread::sleep(Duration::from_millis(10));
                let start = Instant::now();
                q.invalidate();
                assert_eq!(consumer.join().unwrap(), None, "{kind:?}");
                assert!(start.elapsed() < Duration::from_secs(2), "{kind:?}");
            });
            assert!(!q.is_valid());
            // Invariant: no pop succeeds after invalidation.
            q.push(1);
            assert!(q.try_pop().is_none(), "{kind:?}");
        }
    }

    #[test]
    fn test_clear() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            q.push(1);
            q.push(2);
            q.clear();
            assert!(q.is_empty(), "{kind:?}");
            assert!(q.is_valid(), "{kind:?}");
        }
    }

    #[test]
    fn test_wait_push_respects_bound() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            assert!(q.wait_push(1, 2));
            assert!(q.wait_push(2, 2));
            thread::scope(|s| {
                let producer = s.spawn(|| q.wait_push(3, 2));
                thread::sleep(Duration::from_millis(10));
                assert_eq!(q.len(), 2, "{kind:?}");
                assert_eq!(q.try_pop(), Some(1), "{kind:?}");
                assert!(producer.join().unwrap(), "{kind:?}");
            });
            assert_eq!(q.len(), 2, "{kind:?}");
        }
    }

    #[test]
    fn test_wait_push_fails_on_invalidate() {
        for kind in KINDS {
            let q: TaskQueue<u32> = TaskQueue::new(kind);
            q.push(1);
            thread::scope(|s| {
                let producer = s.spawn(|| q.wait_push(2, 1));
                thread::sleep(Duration::from_millis(10));
                q.invalidate();
                assert!(!producer.join().unwrap(), "{kind:?}");
            });
        }
    }

    #[test]
    fn test_multi_producer_totals() {
        for kind in KINDS {
            let q: TaskQueue<u64> = TaskQueue::new(kind);
            let n_producers = 4u64;
            let per_producer = 1000u64;
            thread::scope(|s| {
                for p in 0..n_producers {
                    let q = &q;
                    s.spawn(move || {
                        for i in 0..per_producer {
                            q.push(p * per_producer + i);
                        }
                    });
                }
            });
            let mut sum = 0u64;
            let mut count = 0u64;
            while let Some(v) = q.try_pop() {
                sum += v;
                count += 1;
            }
            let total = n_producers * per_producer;
            assert_eq!(count, total, "{kind:?}");
            assert_eq!(sum, total * (total - 1) / 2, "{kind:?}");
        }
    }
}
