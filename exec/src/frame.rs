//! Per-invocation kernel scratch.
//!
//! One [`KernelFrame`] is allocated per dispatch pass and reused across every
//! kernel that fires in it. The executor fills in arguments, attributes and
//! sub-functions; the kernel reads them and must set every result slot
//! before returning.

use std::ptr;

use smallvec::SmallVec;

use tarn_host::async_value::{AsyncValue, ValueRef};
use tarn_host::diagnostic::{Location, emit_error};
use tarn_host::host::{ExecutionContext, HostContext};

use crate::image::ProgramFn;

/// Invocation record passed to a kernel implementation.
///
/// Argument values are borrowed: the registers' earmarked user references
/// keep them alive for the duration of the call, and the executor releases
/// one reference per argument after the kernel returns.
pub struct KernelFrame {
    ctx: ExecutionContext,
    location: Location,
    attribute_base: *const u8,
    attribute_len: usize,
    arguments: SmallVec<[*const AsyncValue; 8]>,
    attributes: SmallVec<[*const u8; 4]>,
    functions: SmallVec<[ProgramFn; 2]>,
    results: SmallVec<[Option<ValueRef>; 4]>,
}

impl KernelFrame {
    pub(crate) fn new(ctx: ExecutionContext, attribute_section: &[u8]) -> KernelFrame {
        KernelFrame {
            ctx,
            location: Location::default(),
            attribute_base: attribute_section.as_ptr(),
            attribute_len: attribute_section.len(),
            arguments: SmallVec::new(),
            attributes: SmallVec::new(),
            functions: SmallVec::new(),
            results: SmallVec::new(),
        }
    }

    /// Clear everything that varies per kernel.
    pub(crate) fn reset(&mut self) {
        self.location = Location::default();
        self.arguments.clear();
        self.attributes.clear();
        self.functions.clear();
        self.results.clear();
    }

    pub fn ctx(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn host(&self) -> &std::sync::Arc<HostContext> {
        self.ctx.host()
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub(crate) fn set_location(&mut self, location: Location) {
        self.location = location;
    }

    pub(crate) fn add_arg(&mut self, value: *const AsyncValue) {
        debug_assert!(!value.is_null());
        self.arguments.push(value);
    }

    pub(crate) fn arguments(&self) -> &[*const AsyncValue] {
        &self.arguments
    }

    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    /// The `index`-th argument value.
    pub fn argument(&self, index: usize) -> &AsyncValue {
        // SAFETY: the executor holds the register's earmarked user reference
        // for each argument until after the kernel returns.
        unsafe { &*self.arguments[index] }
    }

    /// Typed payload of the `index`-th argument. Panics if the argument is
    /// unavailable or of another type; arguments of strict kernels are
    /// always available and non-error.
    pub fn argument_value<T: 'static>(&self, index: usize) -> &T {
        self.argument(index).get::<T>()
    }

    pub(crate) fn set_num_results(&mut self, count: usize) {
        debug_assert!(self.results.is_empty());
        self.results.resize(count, None);
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    /// Publish `value` as the `index`-th result.
    pub fn set_result(&mut self, index: usize, value: ValueRef) {
        debug_assert!(self.results[index].is_none(), "kernel set a result twice");
        self.results[index] = Some(value);
    }

    /// Publish an already-available value as the `index`-th result.
    pub fn emplace_result<T: Send + Sync + 'static>(&mut self, index: usize, value: T) {
        self.set_result(index, AsyncValue::available(value));
    }

    /// Report an error against the kernel's location and replicate it into
    /// every result slot the kernel has not set yet.
    pub fn report_error(&mut self, message: &str) {
        let error = emit_error(&self.location, message);
        for slot in &mut self.results {
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
    }

    pub(crate) fn take_result(&mut self, index: usize) -> ValueRef {
        self.results[index].take().expect("kernel did not set a result async value")
    }

    pub(crate) fn add_attribute(&mut self, offset: usize) {
        debug_assert!(offset <= self.attribute_len);
        // Attributes may be zero-length, so the offset can sit one past the
        // end of the section.
        // SAFETY: bounds checked against the section just above.
        self.attributes.push(unsafe { self.attribute_base.add(offset) });
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    /// Raw pointer to the `index`-th attribute's bytes.
    pub fn attribute_ptr(&self, index: usize) -> *const u8 {
        self.attributes[index]
    }

    fn attribute_offset(&self, index: usize) -> usize {
        self.attributes[index] as usize - self.attribute_base as usize
    }

    /// Read the `index`-th attribute as a scalar of type `T`.
    pub fn attribute<T: Copy>(&self, index: usize) -> T {
        let offset = self.attribute_offset(index);
        assert!(
            offset + std::mem::size_of::<T>() <= self.attribute_len,
            "attribute read past the end of the attribute section"
        );
        // SAFETY: in bounds per the assert; unaligned reads are fine for any
        // Copy scalar the encoder can emit.
        unsafe { ptr::read_unaligned(self.attributes[index].cast::<T>()) }
    }

    /// Read the `index`-th attribute as a length-prefixed string.
    pub fn string_attribute(&self, index: usize) -> &str {
        let offset = self.attribute_offset(index);
        let len = self.attribute::<u32>(index) as usize;
        let start = offset + std::mem::size_of::<u32>();
        assert!(start + len <= self.attribute_len, "string attribute out of bounds");
        // SAFETY: in bounds per the assert; the section outlives the frame
        // because the executor holds the image alive.
        let bytes = unsafe { std::slice::from_raw_parts(self.attribute_base.add(start), len) };
        std::str::from_utf8(bytes).expect("string attribute is not UTF-8")
    }

    pub(crate) fn add_function(&mut self, function: ProgramFn) {
        self.functions.push(function);
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// The `index`-th sub-function referenced by the kernel.
    pub fn function(&self, index: usize) -> &ProgramFn {
        &self.functions[index]
    }

    /// Convenience for kernels that report one error: an error value with
    /// this kernel's decoded location.
    pub fn emit_error(&self, message: &str) -> ValueRef {
        emit_error(&self.location, message)
    }
}
