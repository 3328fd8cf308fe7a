//! Program assembly.
//!
//! Builders pack kernels into the executor's record format: they lay out the
//! attribute section, compute each register's user count and the per-result
//! used-by fan-out lists, and synthesize the arguments pseudo-kernel for
//! functions that take inputs. Compilation from a source dialect is a
//! different layer; this is the last mile shared by compilers and tests.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use tarn_host::diagnostic::DecodedLocation;

use crate::error::{
    DuplicateFunctionSnafu, FunctionIndexOutOfRangeSnafu, RegisterOutOfRangeSnafu,
    RegisterRedefinedSnafu, Result, UndefinedRegisterSnafu,
};
use crate::image::{EncodedFunction, Program, ProgramImage};
use crate::kernel::{KERNEL_ENTRY_ALIGNMENT, SpecialAttribute};
use crate::registry::KernelRegistry;

/// One kernel inside a function under construction.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    name: String,
    location: u32,
    non_strict: bool,
    arguments: SmallVec<[u32; 4]>,
    attributes: SmallVec<[u32; 4]>,
    functions: SmallVec<[u32; 2]>,
    results: SmallVec<[u32; 4]>,
}

impl KernelSpec {
    pub fn new(name: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_owned(),
            location: 0,
            non_strict: false,
            arguments: SmallVec::new(),
            attributes: SmallVec::new(),
            functions: SmallVec::new(),
            results: SmallVec::new(),
        }
    }

    /// Argument registers, in kernel argument order.
    pub fn arguments(mut self, registers: impl IntoIterator<Item = u32>) -> KernelSpec {
        self.arguments.extend(registers);
        self
    }

    /// Attribute offsets from [`ProgramBuilder::scalar_attribute`] and
    /// friends, in kernel attribute order.
    pub fn attributes(mut self, offsets: impl IntoIterator<Item = u32>) -> KernelSpec {
        self.attributes.extend(offsets);
        self
    }

    /// Sub-function indices, in kernel function order.
    pub fn functions(mut self, indices: impl IntoIterator<Item = u32>) -> KernelSpec {
        self.functions.extend(indices);
        self
    }

    /// Result registers, in kernel result order.
    pub fn results(mut self, registers: impl IntoIterator<Item = u32>) -> KernelSpec {
        self.results.extend(registers);
        self
    }

    pub fn located(mut self, token: u32) -> KernelSpec {
        self.location = token;
        self
    }

    /// Mark the kernel non-strict: it runs even with errored inputs.
    pub fn non_strict(mut self) -> KernelSpec {
        self.non_strict = true;
        self
    }
}

/// One function under construction.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    num_arguments: usize,
    num_registers: u32,
    location: u32,
    kernels: Vec<KernelSpec>,
    results: SmallVec<[u32; 4]>,
}

impl FunctionBuilder {
    /// Start a function. The first `num_arguments` registers are its
    /// argument registers.
    pub fn new(name: &str, num_arguments: usize) -> FunctionBuilder {
        FunctionBuilder {
            name: name.to_owned(),
            num_arguments,
            num_registers: num_arguments as u32,
            location: 0,
            kernels: Vec::new(),
            results: SmallVec::new(),
        }
    }

    /// Allocate a fresh register.
    pub fn register(&mut self) -> u32 {
        let index = self.num_registers;
        self.num_registers += 1;
        index
    }

    /// The register holding the `index`-th function argument.
    pub fn argument(&self, index: usize) -> u32 {
        debug_assert!(index < self.num_arguments);
        index as u32
    }

    pub fn add_kernel(&mut self, kernel: KernelSpec) {
        self.kernels.push(kernel);
    }

    /// Declare the registers returned by the function, in result order.
    pub fn set_results(&mut self, registers: impl IntoIterator<Item = u32>) {
        self.results = registers.into_iter().collect();
    }

    pub fn set_location(&mut self, token: u32) {
        self.location = token;
    }
}

/// Assembles a [`ProgramImage`] from functions, attributes and locations.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    attribute_section: Vec<u8>,
    locations: Vec<DecodedLocation>,
    functions: Vec<FunctionBuilder>,
    function_index: HashMap<String, usize>,
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder::default()
    }

    /// Append a scalar attribute, aligned for `T`, returning its offset.
    pub fn scalar_attribute<T: Copy>(&mut self, value: T) -> u32 {
        self.align_attributes(std::mem::align_of::<T>());
        let offset = self.attribute_section.len() as u32;
        // SAFETY: any Copy scalar is plain bytes of its own size.
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.attribute_section.extend_from_slice(bytes);
        offset
    }

    /// Append a length-prefixed string attribute, returning its offset.
    pub fn string_attribute(&mut self, value: &str) -> u32 {
        self.align_attributes(std::mem::align_of::<u32>());
        let offset = self.attribute_section.len() as u32;
        self.attribute_section.extend_from_slice(&(value.len() as u32).to_ne_bytes());
        self.attribute_section.extend_from_slice(value.as_bytes());
        offset
    }

    /// Append an empty attribute, returning its offset. Kernels taking the
    /// attribute know it carries no bytes.
    pub fn empty_attribute(&mut self) -> u32 {
        self.attribute_section.len() as u32
    }

    fn align_attributes(&mut self, align: usize) {
        while self.attribute_section.len() % align != 0 {
            self.attribute_section.push(0);
        }
    }

    /// Record a source location, returning its token.
    pub fn location(&mut self, filename: &str, line: u32, column: u32) -> u32 {
        let token = self.locations.len() as u32;
        self.locations.push(DecodedLocation { filename: filename.to_owned(), line, column });
        token
    }

    /// Add a finished function. Its index is the number of functions added
    /// before it, which is what kernel function entries reference.
    pub fn add_function(&mut self, function: FunctionBuilder) -> Result<usize> {
        if self.function_index.contains_key(&function.name) {
            return DuplicateFunctionSnafu { name: function.name.as_str() }.fail();
        }
        let index = self.functions.len();
        self.function_index.insert(function.name.clone(), index);
        self.functions.push(function);
        Ok(index)
    }

    /// Validate and pack everything into an immutable program. Kernel names
    /// are resolved to dispatch codes against `registry`.
    pub fn build(self, registry: &KernelRegistry) -> Result<Program> {
        let num_functions = self.functions.len();
        let mut encoded = Vec::with_capacity(num_functions);
        for function in &self.functions {
            encoded.push(encode_function(function, registry, num_functions)?);
        }
        Ok(Program::new(Arc::new(ProgramImage {
            attribute_section: self.attribute_section,
            kernel_impls: registry.implementations().to_vec(),
            kernel_names: registry.names().to_vec(),
            locations: self.locations,
            functions: encoded,
            function_index: self.function_index,
        })))
    }
}

fn encode_function(
    function: &FunctionBuilder,
    registry: &KernelRegistry,
    num_functions: usize,
) -> Result<EncodedFunction> {
    let num_registers = function.num_registers as usize;
    let check_register = |register: u32| -> Result<()> {
        if register as usize >= num_registers {
            return RegisterOutOfRangeSnafu { function: function.name.as_str(), register }.fail();
        }
        Ok(())
    };

    // Each register is produced exactly once: by the arguments pseudo-kernel
    // for argument registers, by one kernel result otherwise.
    let mut produced = vec![false; num_registers];
    for register in 0..function.num_arguments {
        produced[register] = true;
    }
    for kernel in &function.kernels {
        for &register in kernel.arguments.iter().chain(kernel.results.iter()) {
            check_register(register)?;
        }
        for &index in &kernel.functions {
            if index as usize >= num_functions {
                return FunctionIndexOutOfRangeSnafu { function: function.name.as_str(), index }.fail();
            }
        }
        for &register in &kernel.results {
            if produced[register as usize] {
                return RegisterRedefinedSnafu { function: function.name.as_str(), register }.fail();
            }
            produced[register as usize] = true;
        }
    }
    for &register in &function.results {
        check_register(register)?;
    }

    let has_pseudo = function.num_arguments > 0;
    let id_base = has_pseudo as u32;

    // user_count and the used-by lists both count argument *positions*: a
    // kernel reading one register twice decrements twice and releases twice.
    let mut register_users = vec![0u32; num_registers];
    let mut consumers: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); num_registers];
    for (kernel_number, kernel) in function.kernels.iter().enumerate() {
        let kernel_id = kernel_number as u32 + id_base;
        for &register in &kernel.arguments {
            if !produced[register as usize] {
                return UndefinedRegisterSnafu { function: function.name.as_str(), register }.fail();
            }
            register_users[register as usize] += 1;
            consumers[register as usize].push(kernel_id);
        }
    }
    for &register in &function.results {
        if !produced[register as usize] {
            return UndefinedRegisterSnafu { function: function.name.as_str(), register }.fail();
        }
        register_users[register as usize] += 1;
    }

    let mut kernels = Vec::new();
    let mut kernel_offsets = Vec::with_capacity(function.kernels.len() + id_base as usize);

    if has_pseudo {
        // The pseudo-kernel republishes the arguments: no inputs, no
        // attributes, only result registers and their consumers.
        kernel_offsets.push(0);
        kernels.extend_from_slice(&[0, 0, function.location, 0, 0, 0, function.num_arguments as u32]);
        for register in 0..function.num_arguments {
            kernels.push(consumers[register].len() as u32);
        }
        for register in 0..function.num_arguments as u32 {
            kernels.push(register);
        }
        for register in 0..function.num_arguments {
            kernels.extend_from_slice(&consumers[register]);
        }
    }

    for kernel in &function.kernels {
        kernel_offsets.push((kernels.len() * KERNEL_ENTRY_ALIGNMENT) as u32);
        let special = if kernel.non_strict { SpecialAttribute::NonStrict as u32 } else { 0 };
        kernels.extend_from_slice(&[
            registry.code(&kernel.name)?,
            special,
            kernel.location,
            kernel.arguments.len() as u32,
            kernel.attributes.len() as u32,
            kernel.functions.len() as u32,
            kernel.results.len() as u32,
        ]);
        for &register in &kernel.results {
            kernels.push(consumers[register as usize].len() as u32);
        }
        kernels.extend_from_slice(&kernel.arguments);
        kernels.extend_from_slice(&kernel.attributes);
        kernels.extend_from_slice(&kernel.functions);
        kernels.extend_from_slice(&kernel.results);
        for &register in &kernel.results {
            kernels.extend_from_slice(&consumers[register as usize]);
        }
    }

    Ok(EncodedFunction {
        name: function.name.clone(),
        location_offset: function.location,
        num_arguments: function.num_arguments,
        num_results: function.results.len(),
        register_users,
        kernel_offsets,
        result_regs: function.results.clone(),
        kernels,
    })
}
