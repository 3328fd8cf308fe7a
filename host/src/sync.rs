//! Blocking synchronization for callers outside the executor.
//!
//! The executor itself never blocks; these primitives exist for embedders and
//! tests that need to wait for asynchronous completions from a plain thread.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// One-shot signal: many waiters, a single notification.
#[derive(Debug, Default)]
pub struct Notification {
    notified: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Notification {
    pub fn new() -> Notification {
        Notification::default()
    }

    pub fn notify(&self) {
        {
            let _guard = self.mutex.lock();
            self.notified.store(true, Ordering::Release);
        }
        self.condvar.notify_all();
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// Block until [`notify`](Notification::notify) has been called.
    pub fn wait(&self) {
        if self.is_notified() {
            return;
        }
        let mut guard = self.mutex.lock();
        while !self.is_notified() {
            self.condvar.wait(&mut guard);
        }
    }
}

/// Counts in-flight work-queue tasks so the host can quiesce.
#[derive(Debug, Default)]
pub struct TaskTracker {
    pending: Mutex<usize>,
    condvar: Condvar,
}

impl TaskTracker {
    pub fn new() -> TaskTracker {
        TaskTracker::default()
    }

    pub fn task_started(&self) {
        *self.pending.lock() += 1;
    }

    pub fn task_finished(&self) {
        let mut pending = self.pending.lock();
        debug_assert!(*pending > 0, "task_finished without task_started");
        *pending -= 1;
        if *pending == 0 {
            self.condvar.notify_all();
        }
    }

    /// Block until every started task has finished.
    pub fn quiesce(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.condvar.wait(&mut pending);
        }
    }
}
