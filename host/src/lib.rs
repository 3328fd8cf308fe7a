//! Host layer for the tarn dataflow executor.
//!
//! Provides the pieces an executor and its kernels share: reference-counted
//! [`AsyncValue`] result cells, diagnostics and location decoding, a
//! concurrent work queue, and the [`HostContext`] tying them together with
//! cooperative cancellation.

pub mod async_value;
pub mod diagnostic;
pub mod host;
pub mod sync;
pub mod work_queue;

pub use async_value::{AsyncValue, State, ValueRef};
pub use diagnostic::{DecodedLocation, Diagnostic, Location, LocationHandler, emit_error};
pub use host::{ExecutionContext, HostContext};
pub use sync::{Notification, TaskTracker};
pub use work_queue::{RayonWorkQueue, Task, WorkQueue};
