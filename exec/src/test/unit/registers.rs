//! Register slot contracts.
//!
//! Exercises both compare-exchange paths of placeholder publication and
//! result installation, including the speculative-refcount reverts, with
//! drop tallies proving conservation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tarn_host::async_value::AsyncValue;
use tarn_host::host::HostContext;

use crate::executor::{get_or_create_register_value, get_register_value, set_register_value};
use crate::image::RegisterInfo;
use crate::test::kernels::Tracked;

#[test]
fn test_get_or_create_publishes_placeholder_once() {
    let host = HostContext::new();
    let reg = RegisterInfo::new(2);

    let first = get_or_create_register_value(&reg, &host);
    // SAFETY: the placeholder's references are all still outstanding.
    assert!(unsafe { (*first).is_unresolved_indirect() });

    let second = get_or_create_register_value(&reg, &host);
    assert!(std::ptr::eq(first, second));

    // Stand in for the two users plus the publication reference.
    // SAFETY: nothing else holds this placeholder.
    unsafe { (*first).drop_ref(3) };
}

#[test]
fn test_set_register_value_direct_install() {
    let reg = RegisterInfo::new(2);
    let drops = Arc::new(AtomicUsize::new(0));
    let value = AsyncValue::available(Tracked::new(1, Arc::clone(&drops)));

    let (installed, already_set) = set_register_value(&reg, value.clone());
    assert!(!already_set);
    assert!(std::ptr::eq(installed, value.as_ptr()));
    assert!(std::ptr::eq(get_register_value(&reg), value.as_ptr()));

    // Stand in for the register's two users.
    // SAFETY: the install earmarked exactly two user references.
    unsafe { (*installed).drop_ref(2) };
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(value);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_set_register_value_forwards_into_placeholder() {
    let host = HostContext::new();
    let reg = RegisterInfo::new(1);

    // A consumer got here first.
    let placeholder = get_or_create_register_value(&reg, &host);

    let drops = Arc::new(AtomicUsize::new(0));
    let value = AsyncValue::available(Tracked::new(9, Arc::clone(&drops)));
    let (installed, already_set) = set_register_value(&reg, value.clone());

    // The speculative install was reverted and the value forwarded instead.
    assert!(already_set);
    assert!(std::ptr::eq(installed, placeholder));
    // SAFETY: the placeholder still holds its user and publication refs.
    let forwarded = unsafe { &*placeholder };
    assert!(forwarded.is_available());
    assert_eq!(forwarded.get::<Tracked>().value, 9);

    // One user consumes through the placeholder, then the producer performs
    // its post-fan-out drop.
    // SAFETY: exactly these two references remain on the placeholder.
    unsafe { (*placeholder).drop_ref(1) };
    unsafe { (*placeholder).drop_ref(1) };

    drop(value);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_get_or_create_one_placeholder() {
    let host = HostContext::new();
    let reg = RegisterInfo::new(4);

    let observed: Vec<usize> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| get_or_create_register_value(&reg, &host) as usize))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    // Exactly one placeholder won; every loser reverted its speculative refs.
    assert!(observed.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(observed[0], get_register_value(&reg) as usize);

    // Stand in for the four users plus the publication reference.
    let value = get_register_value(&reg);
    // SAFETY: nothing else holds this placeholder.
    unsafe { (*value).drop_ref(5) };
}
