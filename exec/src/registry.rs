//! Kernel registry: name to implementation, with dense dispatch codes.

use std::collections::HashMap;

use crate::error::{DuplicateKernelSnafu, KernelNotFoundSnafu, Result};
use crate::frame::KernelFrame;

/// A kernel implementation.
///
/// The kernel reads its arguments, attributes and sub-functions from the
/// frame and must populate every result slot before returning. It owns no
/// references on its arguments; refcount accounting is the executor's job.
pub type KernelFn = fn(&mut KernelFrame);

/// Maps kernel names to implementations and assigns dispatch codes in
/// registration order.
#[derive(Default)]
pub struct KernelRegistry {
    names: Vec<String>,
    implementations: Vec<KernelFn>,
    index: HashMap<String, u32>,
}

impl KernelRegistry {
    pub fn new() -> KernelRegistry {
        KernelRegistry::default()
    }

    pub fn add_kernel(&mut self, name: &str, kernel: KernelFn) -> Result<()> {
        if self.index.contains_key(name) {
            return DuplicateKernelSnafu { name }.fail();
        }
        let code = self.implementations.len() as u32;
        self.index.insert(name.to_owned(), code);
        self.names.push(name.to_owned());
        self.implementations.push(kernel);
        Ok(())
    }

    /// Dispatch code for `name`.
    pub fn code(&self, name: &str) -> Result<u32> {
        self.index.get(name).copied().ok_or_else(|| KernelNotFoundSnafu { name }.build())
    }

    pub fn len(&self) -> usize {
        self.implementations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }

    pub(crate) fn implementations(&self) -> &[KernelFn] {
        &self.implementations
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry").field("kernels", &self.names).finish()
    }
}
