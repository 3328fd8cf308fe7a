//! Kernel dispatch and value forwarding for tarn programs.
//!
//! A program is a set of functions, each a dataflow graph of kernels wired
//! through registers. This crate decodes function tables from a
//! [`ProgramImage`], dispatches kernels as their inputs become available and
//! forwards results to downstream consumers, honoring both synchronous and
//! asynchronous kernel completion with eager error propagation.
//!
//! The host-side primitives (async values, work queue, cancellation) live in
//! `tarn-host`; this crate supplies the engine on top of them.

pub mod builder;
pub mod error;
mod executor;
pub mod frame;
pub mod image;
pub mod kernel;
pub mod registry;

#[cfg(test)]
pub mod test;

pub use builder::{FunctionBuilder, KernelSpec, ProgramBuilder};
pub use error::{Error, Result};
pub use frame::KernelFrame;
pub use image::{DecodedFunction, KernelInfo, Program, ProgramFn, ProgramImage, RegisterInfo};
pub use kernel::{KERNEL_ENTRY_ALIGNMENT, KernelRecord, SpecialAttribute};
pub use registry::{KernelFn, KernelRegistry};
