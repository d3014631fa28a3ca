// Copyright (c) The hetpool Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Blocking result wrappers.
//!
//! [`TaskFuture`] delivers a task's return value over a one-shot channel.
//! Like a future returned from `std::async` elsewhere, it waits on drop:
//! letting one go out of scope without calling [`TaskFuture::get`] blocks
//! until the task has finished, so a submitted task never outlives the
//! handle its caller was given.
//!
//! Contract: resolve every future before shutting the pool down. A future
//! whose task was still queued when the queues were invalidated never
//! resolves.

use std::ffi::c_void;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;

pub struct TaskFuture<T> {
    rx: channel::Receiver<T>,
    resolved: bool,
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(rx: channel::Receiver<T>) -> TaskFuture<T> {
        TaskFuture { rx, resolved: false }
    }

    /// Block until the task completes and return its result.
    pub fn get(mut self) -> Result<T> {
        self.resolved = true;
        self.rx.recv().context("task result channel closed")
    }
}

impl<T> Drop for TaskFuture<T> {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.rx.recv();
        }
    }
}

/// Boxed-closure envelope adapting safe closures onto the raw
/// `(fn, *mut c_void)` task ABI. The trampoline reclaims the box, so the
/// envelope is freed exactly when the task runs.
pub(crate) struct Envelope {
    job: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Envelope {
    pub(crate) fn into_raw(job: Box<dyn FnOnce() + Send + 'static>) -> *mut c_void {
        Box::into_raw(Box::new(Envelope { job: Some(job) })) as *mut c_void
    }
}

pub(crate) fn envelope_trampoline(arg: *mut c_void) {
    let mut envelope = unsafe { Box::from_raw(arg as *mut Envelope) };
    if let Some(job) = envelope.job.take() {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_returns_value() {
        let (tx, rx) = channel::bounded(1);
        let fut = TaskFuture::new(rx);
        tx.send(42u32).unwrap();
        assert_eq!(fut.get().unwrap(), 42);
    }

    #[test]
    fn test_drop_waits_for_completion() {
        let (tx, rx) = channel::bounded(1);
        let fut = TaskFuture::new(rx);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            done2.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        drop(fut);
        assert!(done.load(Ordering::SeqCst));
        producer.join().unwrap();
    }

    #[test]
    fn test_envelope_round_trip() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let raw = Envelope::into_raw(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        }));
        envelope_trampoline(raw);
        assert!(ran.load(Ordering::SeqCst));
    }
}
