//! The kernel dispatch and value-forwarding engine.
//!
//! An [`Executor`] drives one function invocation: it walks every kernel
//! once, decrementing each kernel's arguments-not-ready counter for each
//! input that is already available, fires kernels whose counter hits zero,
//! installs their results into registers and fans out to the consumers.
//! Synchronously produced results keep the pass going on the same thread;
//! asynchronous ones re-enter the loop from whatever thread completes them.
//!
//! All cross-thread coordination is lock-free: register slots are atomic
//! value pointers written through compare-exchange, readiness is an atomic
//! countdown, and the executor's own lifetime is carried by the handles
//! moved into pending completion closures.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use smallvec::SmallVec;
use tracing::{debug, trace};

use tarn_host::async_value::{AsyncValue, ValueRef};
use tarn_host::diagnostic::{DecodedLocation, Location, LocationHandler};
use tarn_host::host::{ExecutionContext, HostContext};

use crate::frame::KernelFrame;
use crate::image::{DecodedFunction, KernelInfo, ProgramFn, ProgramImage, RegisterInfo};
use crate::kernel::{KERNEL_ENTRY_ALIGNMENT, KernelRecord};

/// Pending kernel ids, processed back-to-front so kernels made ready by a
/// fan-out run immediately, while their inputs are still hot.
type Worklist = SmallVec<[u32; 16]>;

pub(crate) fn get_register_value(reg: &RegisterInfo) -> *const AsyncValue {
    reg.value.load(Ordering::Acquire)
}

/// The register's current value, or a freshly published unresolved indirect
/// placeholder if no producer has landed yet.
///
/// The returned pointer is borrowed: callers consume the register's
/// earmarked user references, never this function's.
pub(crate) fn get_or_create_register_value(
    reg: &RegisterInfo,
    host: &HostContext,
) -> *const AsyncValue {
    let value = reg.value.load(Ordering::Acquire);
    if !value.is_null() {
        return value;
    }

    // No producer yet: publish a placeholder consumers can subscribe to.
    // Speculatively raise the refcount in the expectation that the exchange
    // succeeds: user_count references to be consumed by the register's
    // users, on top of the +1 the handle starts with, which pays for the
    // publication itself.
    let indirect = host.make_indirect();
    indirect.add_ref(reg.user_count);
    let raw = indirect.into_raw();

    match reg.value.compare_exchange(
        ptr::null_mut(),
        raw.cast_mut(),
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => raw,
        Err(existing) => {
            // A concurrent producer or consumer won the race; the placeholder
            // was never published, so take back all user_count + 1 refs.
            // SAFETY: we still own every reference handed to `raw`.
            unsafe { (*raw).drop_ref(reg.user_count + 1) };
            existing.cast_const()
        }
    }
}

/// Install a freshly produced result into a register with `user_count > 0`.
///
/// Consumes the caller's +1 reference to `new_value`. Returns the value now
/// reachable through the register, plus a flag telling the caller to drop
/// one reference to it once fan-out is done (set when a placeholder was
/// already published and the value was forwarded into it).
pub(crate) fn set_register_value(
    reg: &RegisterInfo,
    new_value: ValueRef,
) -> (*const AsyncValue, bool) {
    debug_assert!(reg.user_count > 0, "set_register_value on a register nobody uses");

    // Speculatively raise the refcount in the expectation that the exchange
    // succeeds. The register's users consume user_count references; the
    // caller's +1 and the publication's own use cancel out, so user_count - 1
    // more are needed.
    new_value.add_ref(reg.user_count - 1);
    let raw = new_value.into_raw();

    match reg.value.compare_exchange(
        ptr::null_mut(),
        raw.cast_mut(),
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => (raw, false),
        Err(existing) => {
            // The only way the slot can be occupied before its producer runs
            // is a placeholder published for an early consumer. Revert the
            // speculative references and forward the caller's +1 into it.
            // SAFETY: reclaims the caller's original reference.
            let new_value = unsafe { ValueRef::from_raw(raw) };
            // SAFETY: the speculative user_count - 1 references are ours to
            // revert; the handle keeps one.
            unsafe { new_value.drop_ref(reg.user_count - 1) };

            // SAFETY: `existing` is counted by the register and stays alive
            // until the caller performs the drop signalled below.
            let indirect = unsafe { &*existing.cast_const() };
            debug_assert!(indirect.is_unresolved_indirect());
            indirect.forward_to(new_value);

            (existing.cast_const(), true)
        }
    }
}

/// Force every kernel waiting on an errored input down to a single pending
/// count, so one more decrement fires it. Errors thereby overtake inputs
/// that have not arrived yet, which shortens error-value lifetimes.
#[cold]
fn set_kernels_with_error_input_ready(
    kernel_infos: &[KernelInfo],
    kernels_with_error_input: &[u32],
) {
    for &kernel_id in kernels_with_error_input {
        let arguments_not_ready = &kernel_infos[kernel_id as usize].arguments_not_ready;
        let mut not_ready = arguments_not_ready.load(Ordering::Acquire);
        while not_ready > 1 {
            match arguments_not_ready.compare_exchange_weak(
                not_ready,
                1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => not_ready = current,
            }
        }
    }
}

/// Install `arguments` into the leading registers. Each gets `user_count`
/// references, consumed one by one as its users run.
fn initialize_argument_registers(arguments: &[ValueRef], register_infos: &[RegisterInfo]) {
    debug_assert!(arguments.len() <= register_infos.len());
    for (argument, reg) in arguments.iter().zip(register_infos.iter()) {
        argument.add_ref(reg.user_count);
        // Pre-publication store: the executor does not exist yet.
        reg.value.store(argument.as_ptr().cast_mut(), Ordering::Relaxed);
    }
}

/// Resolves kernel location tokens against the owning image.
///
/// Handed to kernels through the frame and kept alive, via the anchors in
/// [`Executor::maybe_add_ref_for_result`], as long as any asynchronous
/// result may still want to report a diagnostic.
struct ProgramLocationHandler {
    image: Arc<ProgramImage>,
}

impl LocationHandler for ProgramLocationHandler {
    fn decode_location(&self, token: u32) -> DecodedLocation {
        self.image.decode_location(token)
    }
}

/// One in-flight function invocation.
///
/// Multiple executors can be live at once, and a single executor's passes
/// can run concurrently on different threads when asynchronous kernels
/// complete in parallel. Completion closures each hold an `Arc` handle, so
/// the invocation is torn down exactly when the initial pass and the last
/// pending completion are done.
struct Executor {
    ctx: ExecutionContext,
    image: Arc<ProgramImage>,
    function_index: usize,
    kernel_infos: Box<[KernelInfo]>,
    register_infos: Box<[RegisterInfo]>,
    location_handler: Arc<ProgramLocationHandler>,
}

impl Executor {
    fn kernels(&self) -> &[u32] {
        self.image.function_kernels(self.function_index)
    }

    /// Enqueue the consumers of one kernel result, or subscribe them to an
    /// asynchronous completion.
    fn process_used_bys(
        this: &Arc<Executor>,
        record: &KernelRecord<'_>,
        result_number: usize,
        result: *const AsyncValue,
        entry_offset: &mut usize,
        worklist: &mut Worklist,
    ) {
        let num_used_bys = record.num_used_bys(result_number);
        if num_used_bys == 0 {
            this.maybe_add_ref_for_result(result);
            return;
        }

        let used_bys = record.body_entries(*entry_offset, num_used_bys);
        *entry_offset += num_used_bys;
        debug_assert!(!used_bys.is_empty());

        // SAFETY: the register's earmarked user references keep the value
        // alive while its consumers are processed.
        let result = unsafe { &*result };

        // One state read covers both checks below.
        let state = result.state();

        if state.is_error() {
            set_kernels_with_error_input_ready(&this.kernel_infos, used_bys);
        }

        // Available results (errors included) let every consumer advance as
        // part of this same pass; the worklist avoids recursing.
        if state.is_available() {
            worklist.extend_from_slice(used_bys);
            return;
        }

        // Asynchronous result: wake the consumers when it lands. The
        // executor handle moved into the closure keeps this invocation
        // alive until the completion has run.
        if used_bys.len() == 1 {
            // Single consumer: build the worklist inside the closure to keep
            // the capture small.
            let used_by = used_bys[0];
            let executor = Arc::clone(this);
            result.and_then(move || {
                let mut using_kernel_ids = Worklist::new();
                using_kernel_ids.push(used_by);
                Executor::decrement_arguments_not_ready_counts(&executor, &mut using_kernel_ids);
            });
            return;
        }

        // Multiple consumers: batch them so the completion runs one pass,
        // with headroom for the fan-out of whatever those kernels produce.
        let mut batch = Worklist::with_capacity(used_bys.len() + 4);
        batch.extend_from_slice(used_bys);
        let executor = Arc::clone(this);
        result.and_then(move || {
            let mut using_kernel_ids = batch;
            Executor::decrement_arguments_not_ready_counts(&executor, &mut using_kernel_ids);
        });
    }

    /// Fan out the consumers of the function's arguments.
    ///
    /// The pseudo-kernel at id 0 encodes only result registers (the argument
    /// registers) and their used-by lists; it never dispatches anything.
    fn process_arguments_pseudo_kernel(this: &Arc<Executor>, worklist: &mut Worklist) {
        debug_assert_eq!(worklist.last().copied(), Some(0));
        worklist.pop();

        let record = KernelRecord::new(this.kernels(), 0);
        debug_assert_eq!(record.num_arguments(), 0);
        debug_assert_eq!(record.num_attributes(), 0);
        debug_assert_eq!(record.num_functions(), 0);
        debug_assert_ne!(record.num_results(), 0);

        let results = record.body_entries(0, record.num_results());
        let mut entry_offset = results.len();
        for (result_number, &reg_idx) in results.iter().enumerate() {
            let result_register = &this.register_infos[reg_idx as usize];
            if result_register.user_count == 0 {
                // Encoders sometimes emit argument registers nobody reads;
                // tolerated here, to be eliminated at the source.
                debug!(register = reg_idx, "skipping unused argument register");
                continue;
            }

            let result = get_register_value(result_register);
            debug_assert!(!result.is_null(), "argument register not initialized");
            Executor::process_used_bys(this, &record, result_number, result, &mut entry_offset, worklist);
        }
    }

    /// Anchor the location handler on a pending result.
    ///
    /// Asynchronous kernels may still report diagnostics, so the handler has
    /// to outlive every unavailable result. The executor itself needs no
    /// anchor here: the kernel producing this value already registered a
    /// completion that holds one.
    fn maybe_add_ref_for_result(&self, result: *const AsyncValue) {
        // SAFETY: the caller guarantees the value is alive.
        let result = unsafe { &*result };
        if !result.is_available() {
            let handler = Arc::clone(&self.location_handler);
            result.and_then(move || drop(handler));
        }
    }

    /// The dispatch loop: drop one pending input from each listed kernel and
    /// fire those that become ready, draining the worklist back-to-front.
    fn decrement_arguments_not_ready_counts(this: &Arc<Executor>, worklist: &mut Worklist) {
        // One frame serves every kernel fired by this pass.
        let mut frame = KernelFrame::new(this.ctx.clone(), this.image.attribute_section());

        while let Some(kernel_id) = worklist.pop() {
            let kernel_info = &this.kernel_infos[kernel_id as usize];

            // The 1 -> 0 transition elects exactly one pass to run the
            // kernel; any other prior value means inputs are still missing
            // (or the kernel already fired after error acceleration).
            if kernel_info.arguments_not_ready.fetch_sub(1, Ordering::AcqRel) != 1 {
                continue;
            }

            debug_assert_eq!(kernel_info.offset as usize % KERNEL_ENTRY_ALIGNMENT, 0);
            let record = KernelRecord::new(
                this.kernels(),
                kernel_info.offset as usize / KERNEL_ENTRY_ALIGNMENT,
            );

            let kernel_fn = this.image.kernel_impl(record.code());
            let is_nonstrict = record.is_non_strict();
            trace!(
                kernel = kernel_id,
                name = this.image.kernel_name(record.code()),
                nonstrict = is_nonstrict,
                "running kernel"
            );

            // Errored input seen while assembling the frame. Seeded with the
            // cancellation value so kernels dispatched after a cancel
            // short-circuit exactly like kernels fed an errored argument.
            let mut any_error_argument = this.ctx.host().cancel_async_value();

            frame.reset();

            let mut entry_offset = 0;
            let arguments = record.body_entries(entry_offset, record.num_arguments());
            for &reg_idx in arguments {
                let reg = &this.register_infos[reg_idx as usize];
                // Non-strict kernels may start before every operand landed;
                // missing ones get a placeholder resolved later.
                let value = get_or_create_register_value(reg, this.ctx.host());
                frame.add_arg(value);
                // SAFETY: `value` is kept alive by the register's earmarked
                // user references until released below.
                if unsafe { (*value).is_error() } {
                    any_error_argument = value;
                }
            }

            frame.set_num_results(record.num_results());

            entry_offset += arguments.len();
            let attributes = record.body_entries(entry_offset, record.num_attributes());
            for &attribute_offset in attributes {
                frame.add_attribute(attribute_offset as usize);
            }

            entry_offset += attributes.len();
            let functions = record.body_entries(entry_offset, record.num_functions());
            for &fn_idx in functions {
                frame.add_function(ProgramFn::from_image(Arc::clone(&this.image), fn_idx as usize));
            }

            if any_error_argument.is_null() || is_nonstrict {
                let handler = Arc::clone(&this.location_handler) as Arc<dyn LocationHandler>;
                frame.set_location(Location::new(handler, record.location_token()));
                // The kernel must fill every result slot before returning.
                kernel_fn(&mut frame);
            } else {
                // Strict kernel with an errored input: never run it, just
                // replicate the error into every result.
                // SAFETY: `any_error_argument` is either the host's cancel
                // value or an argument whose references are still held.
                let error = unsafe { &*any_error_argument };
                for result_number in 0..frame.num_results() {
                    frame.set_result(result_number, ValueRef::form_ref(error));
                }
            }

            // The kernel has seen its arguments; release this kernel's use
            // of each, which may free them.
            for &argument in frame.arguments() {
                // SAFETY: one earmarked user reference per argument belongs
                // to this kernel.
                unsafe { (*argument).drop_ref(1) };
            }

            entry_offset += functions.len();
            let results = record.body_entries(entry_offset, record.num_results());
            entry_offset += results.len();
            for (result_number, &reg_idx) in results.iter().enumerate() {
                let result_register = &this.register_infos[reg_idx as usize];

                // Real kernels may find their result register empty or
                // holding a placeholder for early consumers, never a
                // concrete value.
                debug_assert!({
                    let current = get_register_value(result_register);
                    current.is_null() || unsafe { (*current).is_unresolved_indirect() }
                });

                let result = frame.take_result(result_number);
                if result_register.user_count == 0 {
                    // Nobody consumes this result; it only needs to keep
                    // diagnostics decodable until it completes.
                    this.maybe_add_ref_for_result(result.as_ptr());
                    drop(result);
                    continue;
                }

                let (register_value, register_already_set) =
                    set_register_value(result_register, result);

                Executor::process_used_bys(
                    this,
                    &record,
                    result_number,
                    register_value,
                    &mut entry_offset,
                    worklist,
                );

                if register_already_set {
                    // Fan-out is done with the forwarded placeholder.
                    // SAFETY: set_register_value left us one reference.
                    unsafe { (*register_value).drop_ref(1) };
                }
            }
        }
    }
}

/// Run `function` to completion: install the arguments, fire every kernel
/// whose inputs are present, and publish one value per declared function
/// result, possibly still pending.
pub(crate) fn execute(
    ctx: &ExecutionContext,
    function: &ProgramFn,
    arguments: &[ValueRef],
    results: &mut [Option<ValueRef>],
) {
    debug!(function = function.name(), "function execution start");
    debug_assert_eq!(
        arguments.len(),
        function.num_arguments(),
        "incorrect number of arguments passed to function call"
    );
    debug_assert_eq!(
        results.len(),
        function.num_results(),
        "incorrect number of results passed to function call"
    );

    if function.kernels().is_empty() {
        return;
    }

    let image = Arc::clone(function.image());
    let DecodedFunction { location_offset, register_infos, kernel_infos, result_regs } =
        image.read_function(function.index());
    debug_assert_eq!(result_regs.len(), function.num_results());
    trace!(function = function.name(), location = location_offset, "decoded function tables");

    // Arguments land in the leading registers before anything runs.
    initialize_argument_registers(arguments, &register_infos);

    let executor = Arc::new(Executor {
        ctx: ctx.clone(),
        location_handler: Arc::new(ProgramLocationHandler { image: Arc::clone(&image) }),
        image,
        function_index: function.index(),
        kernel_infos,
        register_infos,
    });

    // Visit every kernel once, id 0 on top of the stack: counters were
    // initialized to one more than the argument count, so this initial
    // decrement fires exactly the kernels whose inputs are all present,
    // in clean top-down order.
    let mut worklist = Worklist::with_capacity(executor.kernel_infos.len() + 4);
    for kernel_id in (0..executor.kernel_infos.len() as u32).rev() {
        worklist.push(kernel_id);
    }

    // A function with arguments starts with the arguments pseudo-kernel,
    // which only fans out the already-installed argument values.
    if !arguments.is_empty() {
        Executor::process_arguments_pseudo_kernel(&executor, &mut worklist);
    }

    Executor::decrement_arguments_not_ready_counts(&executor, &mut worklist);

    // Publish the function results. Asynchronous kernels may not have
    // reached the result registers yet; those get a placeholder the caller
    // can subscribe to, resolved when the producer lands.
    for (result, &reg_idx) in results.iter_mut().zip(result_regs.iter()) {
        debug_assert!(result.is_none(), "result slot already populated");
        let reg = &executor.register_infos[reg_idx as usize];
        let value = get_or_create_register_value(reg, ctx.host());
        // SAFETY: the function result is one of the register's counted
        // users; take over that earmarked reference.
        *result = Some(unsafe { ValueRef::from_raw(value) });
    }

    // The local handle kept the executor alive through setup. From here on,
    // only pending completion closures hold it, and the invocation is torn
    // down as soon as the last one runs.
    drop(executor);
    debug!(function = function.name(), "function execution end");
}
