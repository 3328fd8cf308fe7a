//! Concurrent work queue used by asynchronous kernels.
//!
//! Kernels that complete asynchronously hand their tail work to the host's
//! queue and return immediately; completions may therefore fire from any
//! worker thread. The default implementation submits onto rayon's global
//! thread pool.

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Abstract task submission, so embedders can bring their own pool.
pub trait WorkQueue: Send + Sync {
    fn add_task(&self, task: Task);
}

/// Work queue backed by rayon's global thread pool.
#[derive(Debug, Default)]
pub struct RayonWorkQueue;

impl WorkQueue for RayonWorkQueue {
    fn add_task(&self, task: Task) {
        rayon::spawn(task);
    }
}
