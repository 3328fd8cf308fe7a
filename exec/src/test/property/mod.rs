//! Property tests for the executor.
//!
//! The interesting behaviors are order-dependent: asynchronous producers may
//! complete in any interleaving, and the executor must converge to the same
//! results with no reference leaked, whichever order the host picks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use tarn_host::async_value::ValueRef;

use crate::builder::{FunctionBuilder, KernelSpec, ProgramBuilder};
use crate::image::Program;
use crate::test::kernels::{self, Tracked};
use crate::test::test_env;

/// A function that sums `n` parked asynchronous producers with a chain of
/// adds. Returns the program and the producers' park channel.
fn sum_of_pending(n: usize, add_kernel: &str) -> (Program, u32) {
    let registry = kernels::test_registry();
    let channel = kernels::pending_channel();
    let mut program = ProgramBuilder::new();
    let attr = program.scalar_attribute(channel);

    let mut f = FunctionBuilder::new("sum_pending", 0);
    let inputs: Vec<u32> = (0..n)
        .map(|_| {
            let reg = f.register();
            f.add_kernel(KernelSpec::new("tarn_test.pending.i32").attributes([attr]).results([reg]));
            reg
        })
        .collect();

    let mut acc = inputs[0];
    for &input in &inputs[1..] {
        let next = f.register();
        f.add_kernel(KernelSpec::new(add_kernel).arguments([acc, input]).results([next]));
        acc = next;
    }
    f.set_results([acc]);
    program.add_function(f).unwrap();

    (program.build(&registry).unwrap(), channel)
}

/// Number of inputs plus a completion order over them.
fn inputs_and_order() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (2usize..6).prop_flat_map(|n| {
        let order: Vec<usize> = (0..n).collect();
        (Just(n), Just(order).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The result is the same for every completion order, and it only
    /// becomes available once the last producer has landed.
    #[test]
    fn completion_order_is_irrelevant((n, order) in inputs_and_order()) {
        let (program, channel) = sum_of_pending(n, "tarn_test.add.i32");
        let (_host, ctx) = test_env();

        let mut results = [None];
        program.function("sum_pending").unwrap().execute(&ctx, &[], &mut results);
        let result = results[0].take().unwrap();

        let parked = kernels::take_pending(channel);
        prop_assert_eq!(parked.len(), n);

        let (&last, rest) = order.split_last().unwrap();
        for &producer in rest {
            parked[producer].set_value(producer as i32 * 10 + 1);
            prop_assert!(!result.is_available());
        }
        parked[last].set_value(last as i32 * 10 + 1);

        prop_assert!(result.is_available());
        prop_assert!(!result.is_error());
        let expected: i32 = (0..n).map(|producer| producer as i32 * 10 + 1).sum();
        prop_assert_eq!(*result.get::<i32>(), expected);
    }

    /// Whatever the completion order, every payload produced anywhere in the
    /// graph is dropped exactly once by the time the caller lets go.
    #[test]
    fn refcounts_conserved_under_random_completion((n, order) in inputs_and_order()) {
        let (program, channel) = sum_of_pending(n, "tarn_test.add.tracked");
        let (_host, ctx) = test_env();

        let mut results = [None];
        program.function("sum_pending").unwrap().execute(&ctx, &[], &mut results);
        let result = results[0].take().unwrap();

        let parked: Vec<ValueRef> = kernels::take_pending(channel);
        prop_assert_eq!(parked.len(), n);

        let drops = Arc::new(AtomicUsize::new(0));
        for &producer in &order {
            parked[producer].set_value(Tracked::new(producer as i32, Arc::clone(&drops)));
        }

        prop_assert!(result.is_available());
        prop_assert_eq!(result.get::<Tracked>().value, (0..n as i32).sum::<i32>());

        // n produced inputs plus n - 1 intermediate sums.
        drop(result);
        drop(parked);
        prop_assert_eq!(drops.load(Ordering::SeqCst), 2 * n - 1);
    }
}
