//! End-to-end executor scenarios.
//!
//! Each test assembles a small function with the builder, runs it, and
//! checks results, error propagation and refcount conservation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use test_case::test_case;

use tarn_host::async_value::AsyncValue;

use crate::builder::{FunctionBuilder, KernelSpec, ProgramBuilder};
use crate::test::kernels::{self, Tracked};
use crate::test::test_env;

#[test]
fn test_identity_forwards_argument() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let mut f = FunctionBuilder::new("identity", 1);
    let a = f.argument(0);
    f.set_results([a]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let function = program.function("identity").unwrap();

    let drops = Arc::new(AtomicUsize::new(0));
    let argument = AsyncValue::available(Tracked::new(7, Arc::clone(&drops)));
    let mut results = [None];
    function.execute(&ctx, std::slice::from_ref(&argument), &mut results);

    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert_eq!(result.get::<Tracked>().value, 7);

    // Every reference the executor took was released again: the payload
    // survives exactly as long as the caller's own handles.
    drop(result);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(argument);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test_case(1)]
#[test_case(7)]
#[test_case(-13)]
fn test_constant_roundtrip(value: i32) {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(value);
    let mut f = FunctionBuilder::new("constant", 0);
    let x = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.constant.i32").attributes([attr]).results([x]));
    f.set_results([x]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("constant").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert_eq!(*result.get::<i32>(), value);
}

#[test]
fn test_synchronous_chain_completes_in_one_pass() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(3i32);
    let mut f = FunctionBuilder::new("chain", 0);
    let x = f.register();
    let y = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.constant.i32").attributes([attr]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([x]).results([y]));
    f.set_results([y]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("chain").unwrap().execute(&ctx, &[], &mut results);

    // Both kernels ran in the initial pass: the result is concrete before
    // execute() even returned, with no completion registered anywhere.
    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert_eq!(*result.get::<i32>(), 4);
}

#[test]
fn test_asynchronous_fan_out() {
    let registry = kernels::test_registry();
    let channel = kernels::pending_channel();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(channel);
    let mut f = FunctionBuilder::new("fan_out", 0);
    let x = f.register();
    let y1 = f.register();
    let y2 = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.pending.i32").attributes([attr]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([x]).results([y1]));
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([x]).results([y2]));
    f.set_results([y1, y2]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None, None];
    program.function("fan_out").unwrap().execute(&ctx, &[], &mut results);

    let y1 = results[0].take().unwrap();
    let y2 = results[1].take().unwrap();
    assert!(!y1.is_available());
    assert!(!y2.is_available());

    let parked = kernels::take_pending(channel);
    assert_eq!(parked.len(), 1);
    parked[0].set_value(5i32);

    assert!(y1.is_available());
    assert!(y2.is_available());
    assert_eq!(*y1.get::<i32>(), 6);
    assert_eq!(*y2.get::<i32>(), 6);
}

#[test]
fn test_pending_result_resolves_and_frees() {
    let registry = kernels::test_registry();
    let channel = kernels::pending_channel();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(channel);
    let mut f = FunctionBuilder::new("pending", 0);
    let x = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.pending.i32").attributes([attr]).results([x]));
    f.set_results([x]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("pending").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert!(!result.is_available());

    let drops = Arc::new(AtomicUsize::new(0));
    let parked = kernels::take_pending(channel);
    parked[0].set_value(Tracked::new(1, Arc::clone(&drops)));

    assert!(result.is_available());
    assert_eq!(result.get::<Tracked>().value, 1);

    drop(parked);
    drop(result);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_error_short_circuits_strict_consumer() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let message = program.string_attribute("boom");
    let mut f = FunctionBuilder::new("error_chain", 0);
    let x = f.register();
    let y = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.error").attributes([message]).results([x]));
    // If the executor dispatched this strict kernel, it would panic reading
    // an i32 out of an error value; short-circuiting must skip it entirely.
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([x]).results([y]));
    f.set_results([y]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("error_chain").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert!(result.is_error());
    assert_eq!(result.diagnostic().message, "boom");
}

#[test]
fn test_non_strict_kernel_sees_errored_input() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let message = program.string_attribute("boom");
    let fallback = program.scalar_attribute(42i32);
    let mut f = FunctionBuilder::new("recovered", 0);
    let x = f.register();
    let y = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.error").attributes([message]).results([x]));
    f.add_kernel(
        KernelSpec::new("tarn_test.recover.i32")
            .arguments([x])
            .attributes([fallback])
            .results([y])
            .non_strict(),
    );
    f.set_results([y]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("recovered").unwrap().execute(&ctx, &[], &mut results);

    // The kernel ran despite the errored input and chose its own result.
    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert!(!result.is_error());
    assert_eq!(*result.get::<i32>(), 42);
}

#[test]
fn test_cancellation_mid_flight() {
    let registry = kernels::test_registry();
    let channel = kernels::pending_channel();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(channel);
    let mut f = FunctionBuilder::new("cancelable", 0);
    let x = f.register();
    let y = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.pending.i32").attributes([attr]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([x]).results([y]));
    f.set_results([y]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (host, ctx) = test_env();
    let mut results = [None];
    program.function("cancelable").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert!(!result.is_available());

    // Cancel while the producer is still pending; the consumer dispatches
    // only after the cancel value is visible and must observe it.
    host.cancel_execution("execution canceled");
    let parked = kernels::take_pending(channel);
    parked[0].set_value(1i32);

    assert!(result.is_available());
    assert!(result.is_error());
    assert_eq!(result.diagnostic().message, "execution canceled");

    host.restart_execution();
}

#[test]
fn test_error_acceleration_fires_before_remaining_inputs() {
    let registry = kernels::test_registry();
    let channel = kernels::pending_channel();
    let mut program = ProgramBuilder::new();
    let message = program.string_attribute("early failure");
    let attr = program.scalar_attribute(channel);
    let mut f = FunctionBuilder::new("accelerated", 0);
    let x = f.register();
    let y = f.register();
    let z = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.error").attributes([message]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.pending.i32").attributes([attr]).results([y]));
    f.add_kernel(KernelSpec::new("tarn_test.add.i32").arguments([x, y]).results([z]));
    f.set_results([z]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("accelerated").unwrap().execute(&ctx, &[], &mut results);

    // The add still waits on y, but the error forced its pending count down
    // so it already fired and propagated the failure.
    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert!(result.is_error());
    assert_eq!(result.diagnostic().message, "early failure");

    // Resolving the straggler afterwards is a no-op for the result.
    let parked = kernels::take_pending(channel);
    parked[0].set_value(9i32);
    assert_eq!(result.diagnostic().message, "early failure");
}

#[test]
fn test_unused_results_are_discarded() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(5i32);
    let mut f = FunctionBuilder::new("partial_count3", 0);
    let x = f.register();
    let r1 = f.register();
    let r2 = f.register();
    let r3 = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.constant.i32").attributes([attr]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.count3.i32").arguments([x]).results([r1, r2, r3]));
    f.set_results([r2]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("partial_count3").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert_eq!(*result.get::<i32>(), 7);
}

#[test]
fn test_multi_result_fan_out_cursors() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(5i32);
    let mut f = FunctionBuilder::new("count3_add", 0);
    let x = f.register();
    let r1 = f.register();
    let r2 = f.register();
    let r3 = f.register();
    let w = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.constant.i32").attributes([attr]).results([x]));
    f.add_kernel(KernelSpec::new("tarn_test.count3.i32").arguments([x]).results([r1, r2, r3]));
    f.add_kernel(KernelSpec::new("tarn_test.add.i32").arguments([r1, r3]).results([w]));
    f.set_results([r2, w]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None, None];
    program.function("count3_add").unwrap().execute(&ctx, &[], &mut results);

    let r2 = results[0].take().unwrap();
    let w = results[1].take().unwrap();
    assert_eq!(*r2.get::<i32>(), 7);
    assert_eq!(*w.get::<i32>(), 14);
}

#[test]
fn test_unused_argument_register_is_skipped() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let mut f = FunctionBuilder::new("ignores_second", 2);
    let out = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([f.argument(0)]).results([out]));
    f.set_results([out]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let arguments = [AsyncValue::available(10i32), AsyncValue::available(99i32)];
    let mut results = [None];
    program.function("ignores_second").unwrap().execute(&ctx, &arguments, &mut results);

    let result = results[0].take().unwrap();
    assert_eq!(*result.get::<i32>(), 11);
}

#[test]
fn test_shared_value_keeps_single_payload() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let mut f = FunctionBuilder::new("share", 1);
    let s1 = f.register();
    let s2 = f.register();
    f.add_kernel(
        KernelSpec::new("tarn_test.share_to_two").arguments([f.argument(0)]).results([s1, s2]),
    );
    f.set_results([s1, s2]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let drops = Arc::new(AtomicUsize::new(0));
    let argument = AsyncValue::available(Tracked::new(3, Arc::clone(&drops)));
    let mut results = [None, None];
    program.function("share").unwrap().execute(&ctx, std::slice::from_ref(&argument), &mut results);

    let s1 = results[0].take().unwrap();
    let s2 = results[1].take().unwrap();
    assert!(std::ptr::eq(s1.get::<Tracked>(), s2.get::<Tracked>()));
    assert_eq!(s1.get::<Tracked>().value, 3);

    drop(s1);
    drop(s2);
    drop(argument);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_kernel_on_work_queue() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let mut f = FunctionBuilder::new("delayed_add1", 1);
    let y = f.register();
    let z = f.register();
    f.add_kernel(
        KernelSpec::new("tarn_test.copy.with_delay.i32").arguments([f.argument(0)]).results([y]),
    );
    f.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([y]).results([z]));
    f.set_results([z]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (host, ctx) = test_env();
    let arguments = [AsyncValue::available(41i32)];
    let mut results = [None];
    program.function("delayed_add1").unwrap().execute(&ctx, &arguments, &mut results);

    let result = results[0].take().unwrap();
    host.await_value(&result);
    assert_eq!(*result.get::<i32>(), 42);
    host.quiesce();
}

#[test]
fn test_nested_function_call() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();

    let mut inner = FunctionBuilder::new("inner_add1", 1);
    let r = inner.register();
    inner.add_kernel(KernelSpec::new("tarn_test.add1.i32").arguments([inner.argument(0)]).results([r]));
    inner.set_results([r]);
    let inner_index = program.add_function(inner).unwrap() as u32;

    let mut outer = FunctionBuilder::new("outer", 1);
    let out = outer.register();
    outer.add_kernel(
        KernelSpec::new("tarn_test.call")
            .arguments([outer.argument(0)])
            .functions([inner_index])
            .results([out]),
    );
    outer.set_results([out]);
    program.add_function(outer).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let arguments = [AsyncValue::available(10i32)];
    let mut results = [None];
    program.function("outer").unwrap().execute(&ctx, &arguments, &mut results);

    let result = results[0].take().unwrap();
    assert!(result.is_available());
    assert_eq!(*result.get::<i32>(), 11);
}

#[test]
fn test_string_kernels() {
    let registry = kernels::test_registry();
    let mut program = ProgramBuilder::new();
    let hello = program.string_attribute("hello, ");
    let world = program.string_attribute("world");
    let mut f = FunctionBuilder::new("greeting", 0);
    let s1 = f.register();
    let s2 = f.register();
    let s3 = f.register();
    f.add_kernel(KernelSpec::new("tarn_test.get_string").attributes([hello]).results([s1]));
    f.add_kernel(KernelSpec::new("tarn_test.get_string").attributes([world]).results([s2]));
    f.add_kernel(KernelSpec::new("tarn_test.append_string").arguments([s1, s2]).results([s3]));
    f.set_results([s3]);
    program.add_function(f).unwrap();
    let program = program.build(&registry).unwrap();

    let (_host, ctx) = test_env();
    let mut results = [None];
    program.function("greeting").unwrap().execute(&ctx, &[], &mut results);

    let result = results[0].take().unwrap();
    assert_eq!(result.get::<String>(), "hello, world");
}
