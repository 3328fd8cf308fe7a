//! The host context: value factories, work submission, cancellation.

use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::debug;

use crate::async_value::{AsyncValue, ValueRef};
use crate::diagnostic::Diagnostic;
use crate::sync::{Notification, TaskTracker};
use crate::work_queue::{RayonWorkQueue, WorkQueue};

/// Shared services for everything running inside one host: asynchronous value
/// construction, a work queue for deferred kernel completions, and the
/// cooperative cancellation flag.
pub struct HostContext {
    work_queue: Box<dyn WorkQueue>,
    tracker: Arc<TaskTracker>,
    /// Sticky cancellation flag: a counted reference to an error-state value,
    /// or null while execution is live.
    cancel_value: AtomicPtr<AsyncValue>,
}

impl HostContext {
    pub fn new() -> Arc<HostContext> {
        HostContext::with_work_queue(Box::new(RayonWorkQueue))
    }

    pub fn with_work_queue(work_queue: Box<dyn WorkQueue>) -> Arc<HostContext> {
        Arc::new(HostContext {
            work_queue,
            tracker: Arc::new(TaskTracker::new()),
            cancel_value: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub fn make_available<T: Send + Sync + 'static>(&self, value: T) -> ValueRef {
        AsyncValue::available(value)
    }

    pub fn make_unconstructed(&self) -> ValueRef {
        AsyncValue::unconstructed()
    }

    pub fn make_error(&self, diagnostic: Diagnostic) -> ValueRef {
        AsyncValue::error(diagnostic)
    }

    pub fn make_indirect(&self) -> ValueRef {
        AsyncValue::indirect()
    }

    /// Submit `work` to the queue. Tracked, so [`quiesce`](Self::quiesce) can
    /// wait for it.
    pub fn enqueue_work(&self, work: impl FnOnce() + Send + 'static) {
        self.tracker.task_started();
        let tracker = Arc::clone(&self.tracker);
        self.work_queue.add_task(Box::new(move || {
            work();
            tracker.task_finished();
        }));
    }

    /// Block until every task submitted through this host has finished.
    pub fn quiesce(&self) {
        self.tracker.quiesce();
    }

    /// Block the calling thread until `value` is available.
    ///
    /// For embedders and tests only; the executor never blocks.
    pub fn await_value(&self, value: &AsyncValue) {
        if value.is_available() {
            return;
        }
        let notification = Arc::new(Notification::new());
        let signal = Arc::clone(&notification);
        value.and_then(move || signal.notify());
        notification.wait();
    }

    /// Request cooperative cancellation. The first request wins and stays
    /// sticky until [`restart_execution`](Self::restart_execution); kernels
    /// dispatched afterwards observe the installed error value as a synthetic
    /// errored argument. Already-running kernels are not interrupted.
    pub fn cancel_execution(&self, message: &str) {
        let error = AsyncValue::error(Diagnostic::new(message));
        let raw = error.into_raw().cast_mut();
        if self
            .cancel_value
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else canceled first; theirs stays installed.
            // SAFETY: `raw` came from `into_raw` above and owns one reference.
            drop(unsafe { ValueRef::from_raw(raw) });
            return;
        }
        debug!(reason = message, "execution canceled");
    }

    /// Clear the cancellation flag so new executions run normally.
    ///
    /// Must not race in-flight executions: they read the flag without taking
    /// a reference.
    pub fn restart_execution(&self) {
        let prior = self.cancel_value.swap(ptr::null_mut(), Ordering::AcqRel);
        if !prior.is_null() {
            // SAFETY: the slot owned one reference to the installed value.
            drop(unsafe { ValueRef::from_raw(prior) });
        }
    }

    /// The installed cancellation value, or null while execution is live.
    ///
    /// Returned as a raw pointer: the slot keeps the reference, and the value
    /// stays alive until [`restart_execution`](Self::restart_execution).
    pub fn cancel_async_value(&self) -> *const AsyncValue {
        self.cancel_value.load(Ordering::Acquire)
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.restart_execution();
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("canceled", &!self.cancel_value.load(Ordering::Acquire).is_null())
            .finish()
    }
}

/// Per-invocation execution context threaded through kernels and executors.
#[derive(Clone)]
pub struct ExecutionContext {
    host: Arc<HostContext>,
}

impl ExecutionContext {
    pub fn new(host: Arc<HostContext>) -> ExecutionContext {
        ExecutionContext { host }
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").finish()
    }
}
