//! Program images and the per-execution tables decoded from them.
//!
//! A [`ProgramImage`] is the self-contained, already-decoded form of a
//! compiled program: the attribute section, the kernel dispatch table, the
//! location table, and one packed kernel stream per function. Images are
//! immutable and shared; every execution decodes its own register and kernel
//! descriptor arrays so concurrent invocations of one function never share
//! counters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicPtr};

use smallvec::SmallVec;

use tarn_host::async_value::{AsyncValue, ValueRef};
use tarn_host::diagnostic::DecodedLocation;
use tarn_host::host::ExecutionContext;

use crate::error::{FunctionNotFoundSnafu, Result};
use crate::executor;
use crate::kernel::KERNEL_ENTRY_ALIGNMENT;
use crate::registry::KernelFn;

/// Per-register descriptor for one execution of a function.
pub struct RegisterInfo {
    /// How many consumers take a reference out of this register: one per
    /// argument position reading it plus one per appearance in the
    /// function's results.
    pub user_count: u32,
    /// The current async value, installed at most twice: null to a first
    /// value, and, if that was an indirect placeholder, the placeholder is
    /// forwarded rather than replaced.
    pub value: AtomicPtr<AsyncValue>,
}

impl RegisterInfo {
    pub fn new(user_count: u32) -> RegisterInfo {
        RegisterInfo { user_count, value: AtomicPtr::new(std::ptr::null_mut()) }
    }
}

impl fmt::Debug for RegisterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterInfo").field("user_count", &self.user_count).finish()
    }
}

/// Per-kernel descriptor for one execution of a function.
pub struct KernelInfo {
    /// Byte offset of the kernel's record in the function's kernel stream.
    pub offset: u32,
    /// Countdown to readiness: one for the initial whole-function visit plus
    /// one per argument. The 1 -> 0 transition fires the kernel. May go
    /// negative after error acceleration forced it to 1 early.
    pub arguments_not_ready: AtomicI32,
}

impl KernelInfo {
    pub fn new(offset: u32, num_arguments: u32) -> KernelInfo {
        KernelInfo { offset, arguments_not_ready: AtomicI32::new(1 + num_arguments as i32) }
    }
}

impl fmt::Debug for KernelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelInfo").field("offset", &self.offset).finish()
    }
}

/// One function's tables, freshly decoded for a single execution.
pub struct DecodedFunction {
    /// Location token of the function itself, for whole-function diagnostics.
    pub location_offset: u32,
    pub register_infos: Box<[RegisterInfo]>,
    pub kernel_infos: Box<[KernelInfo]>,
    /// Registers holding the function's results, in result order.
    pub result_regs: SmallVec<[u32; 4]>,
}

/// Encoded form of one function inside an image.
pub(crate) struct EncodedFunction {
    pub name: String,
    pub location_offset: u32,
    pub num_arguments: usize,
    pub num_results: usize,
    /// `user_count` per register.
    pub register_users: Vec<u32>,
    /// Byte offset of each kernel's record, indexed by kernel id.
    pub kernel_offsets: Vec<u32>,
    pub result_regs: SmallVec<[u32; 4]>,
    /// The packed kernel stream.
    pub kernels: Vec<u32>,
}

/// An immutable, decoded program: attributes, dispatch table, locations and
/// function bodies.
pub struct ProgramImage {
    pub(crate) attribute_section: Vec<u8>,
    pub(crate) kernel_impls: Vec<KernelFn>,
    pub(crate) kernel_names: Vec<String>,
    pub(crate) locations: Vec<DecodedLocation>,
    pub(crate) functions: Vec<EncodedFunction>,
    pub(crate) function_index: HashMap<String, usize>,
}

impl ProgramImage {
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn attribute_section(&self) -> &[u8] {
        &self.attribute_section
    }

    pub(crate) fn kernel_impl(&self, code: u32) -> KernelFn {
        self.kernel_impls[code as usize]
    }

    pub fn kernel_name(&self, code: u32) -> &str {
        self.kernel_names.get(code as usize).map(String::as_str).unwrap_or("(unknown)")
    }

    /// Resolve a location token recorded by the compiler.
    pub fn decode_location(&self, token: u32) -> DecodedLocation {
        self.locations.get(token as usize).cloned().unwrap_or(DecodedLocation {
            filename: "(unknown)".to_owned(),
            line: 0,
            column: 0,
        })
    }

    pub(crate) fn function_kernels(&self, index: usize) -> &[u32] {
        &self.functions[index].kernels
    }

    /// Materialize fresh per-execution tables for the function at `index`.
    pub(crate) fn read_function(&self, index: usize) -> DecodedFunction {
        let function = &self.functions[index];
        let register_infos: Box<[RegisterInfo]> =
            function.register_users.iter().map(|&users| RegisterInfo::new(users)).collect();
        let kernel_infos: Box<[KernelInfo]> = function
            .kernel_offsets
            .iter()
            .map(|&offset| {
                // Argument count lives in the record header.
                let num_arguments = function.kernels[offset as usize / KERNEL_ENTRY_ALIGNMENT + 3];
                KernelInfo::new(offset, num_arguments)
            })
            .collect();
        DecodedFunction {
            location_offset: function.location_offset,
            register_infos,
            kernel_infos,
            result_regs: function.result_regs.clone(),
        }
    }
}

impl fmt::Debug for ProgramImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramImage")
            .field(
                "functions",
                &self.functions.iter().map(|function| function.name.as_str()).collect::<Vec<_>>(),
            )
            .field("kernels", &self.kernel_names)
            .finish()
    }
}

/// Shareable handle to an immutable program.
#[derive(Clone)]
pub struct Program {
    pub(crate) image: Arc<ProgramImage>,
}

impl Program {
    pub(crate) fn new(image: Arc<ProgramImage>) -> Program {
        Program { image }
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Result<ProgramFn> {
        let index = *self
            .image
            .function_index
            .get(name)
            .ok_or_else(|| FunctionNotFoundSnafu { name }.build())?;
        Ok(ProgramFn::from_image(Arc::clone(&self.image), index))
    }

    /// The function added `index`-th to the program.
    pub fn function_at(&self, index: usize) -> ProgramFn {
        debug_assert!(index < self.image.functions.len());
        ProgramFn::from_image(Arc::clone(&self.image), index)
    }

    pub fn num_functions(&self) -> usize {
        self.image.num_functions()
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.image, f)
    }
}

/// A callable function inside a [`ProgramImage`].
#[derive(Clone)]
pub struct ProgramFn {
    image: Arc<ProgramImage>,
    index: usize,
}

impl ProgramFn {
    pub(crate) fn from_image(image: Arc<ProgramImage>, index: usize) -> ProgramFn {
        ProgramFn { image, index }
    }

    pub fn name(&self) -> &str {
        &self.image.functions[self.index].name
    }

    pub fn num_arguments(&self) -> usize {
        self.image.functions[self.index].num_arguments
    }

    pub fn num_results(&self) -> usize {
        self.image.functions[self.index].num_results
    }

    pub(crate) fn image(&self) -> &Arc<ProgramImage> {
        &self.image
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn kernels(&self) -> &[u32] {
        self.image.function_kernels(self.index)
    }

    /// Run the function to completion.
    ///
    /// Arguments must all be provided; `results` must have one `None` slot
    /// per declared result. Results may still be unavailable on return when
    /// the function contains asynchronous kernels; errors surface as
    /// error-state values, never out-of-band.
    pub fn execute(
        &self,
        ctx: &ExecutionContext,
        arguments: &[ValueRef],
        results: &mut [Option<ValueRef>],
    ) {
        executor::execute(ctx, self, arguments, results);
    }
}

impl fmt::Debug for ProgramFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramFn")
            .field("name", &self.name())
            .field("num_arguments", &self.num_arguments())
            .field("num_results", &self.num_results())
            .finish()
    }
}
