//! Error types for program assembly and lookup.
//!
//! These cover the embedder-facing surface only. Errors produced while a
//! function runs travel as error-state async values through the dataflow
//! graph and never surface out-of-band.

use snafu::Snafu;

/// Result type for program operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while assembling or looking up programs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Function lookup failed.
    #[snafu(display("Function '{name}' not found in program"))]
    FunctionNotFound { name: String },

    /// Kernel name could not be resolved against the registry.
    #[snafu(display("Kernel '{name}' is not registered"))]
    KernelNotFound { name: String },

    /// The same kernel name was registered twice.
    #[snafu(display("Kernel '{name}' registered twice"))]
    DuplicateKernel { name: String },

    /// The same function name was added twice.
    #[snafu(display("Function '{name}' defined twice"))]
    DuplicateFunction { name: String },

    /// Two kernels claim the same result register.
    #[snafu(display("Register {register} written by multiple kernels in function '{function}'"))]
    RegisterRedefined { function: String, register: u32 },

    /// A register is consumed but never produced.
    #[snafu(display("Register {register} has no producer in function '{function}'"))]
    UndefinedRegister { function: String, register: u32 },

    /// A kernel or function references a register that was never declared.
    #[snafu(display("Register {register} out of range in function '{function}'"))]
    RegisterOutOfRange { function: String, register: u32 },

    /// A kernel references a sub-function index past the program's table.
    #[snafu(display("Function index {index} out of range in function '{function}'"))]
    FunctionIndexOutOfRange { function: String, index: u32 },
}
