//! Reference-counted asynchronous result cells.
//!
//! An [`AsyncValue`] is the unit of dataflow between kernels: a cell that
//! starts empty and becomes available exactly once, either with a constructed
//! payload or with an error. Consumers attach continuations with
//! [`AsyncValue::and_then`]; producers complete the cell from whatever thread
//! the work queue ran them on.
//!
//! Indirect values ([`AsyncValue::indirect`]) are placeholders published when
//! a consumer shows up before its producer. The producer later calls
//! [`AsyncValue::forward_to`] and the placeholder adopts the concrete value's
//! outcome, transitively through forward chains.
//!
//! # Reference counting
//!
//! The cell carries its own atomic reference count with bulk
//! [`add_ref`](AsyncValue::add_ref) / [`drop_ref`](AsyncValue::drop_ref)
//! operations. The executor pre-raises counts by a register's whole user
//! count in one RMW, which `Arc` cannot express. [`ValueRef`] is the owning
//! handle over one reference; raw-pointer conversions exist so values can
//! live in atomic register slots.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering, fence};

use parking_lot::Mutex;

use crate::diagnostic::Diagnostic;

/// Completion state of an [`AsyncValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Concrete value, payload not yet constructed.
    Unconstructed = 0,
    /// Concrete value, payload constructed.
    Constructed = 1,
    /// Completed with an error.
    Error = 2,
    /// Indirect value not yet forwarded to a concrete one.
    UnresolvedIndirect = 3,
    /// Indirect value forwarded to an available, non-error value.
    ConcreteIndirect = 4,
}

impl State {
    /// Whether the value has reached its final payload (including errors).
    pub fn is_available(self) -> bool {
        matches!(self, State::Constructed | State::Error | State::ConcreteIndirect)
    }

    /// Whether the value completed with an error.
    pub fn is_error(self) -> bool {
        self == State::Error
    }

    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Unconstructed,
            1 => State::Constructed,
            2 => State::Error,
            3 => State::UnresolvedIndirect,
            4 => State::ConcreteIndirect,
            _ => unreachable!("corrupt async value state"),
        }
    }
}

enum Payload {
    Empty,
    Value(Box<dyn Any + Send + Sync>),
    Error(Arc<Diagnostic>),
    /// Adopted outcome of a forwarded indirect value.
    Forward(ValueRef),
}

type Waiter = Box<dyn FnOnce() + Send>;

/// A reference-counted, state-transitioning result cell.
///
/// Values are always heap-allocated and handed out as [`ValueRef`]s. The
/// payload is written at most once, before the state flips to an available
/// one; after that it is immutable and readable without synchronization
/// beyond the acquire load in [`state`](AsyncValue::state).
pub struct AsyncValue {
    refcount: AtomicU32,
    state: AtomicU8,
    payload: UnsafeCell<Payload>,
    waiters: Mutex<Vec<Waiter>>,
}

// SAFETY: the payload cell is only mutated under the waiter lock while the
// value is unavailable, and all payloads are Send + Sync.
unsafe impl Send for AsyncValue {}
unsafe impl Sync for AsyncValue {}

impl AsyncValue {
    fn allocate(state: State, payload: Payload) -> ValueRef {
        let cell = Box::new(AsyncValue {
            refcount: AtomicU32::new(1),
            state: AtomicU8::new(state as u8),
            payload: UnsafeCell::new(payload),
            waiters: Mutex::new(Vec::new()),
        });
        ValueRef { ptr: NonNull::from(Box::leak(cell)) }
    }

    /// An already-available value holding `value`.
    pub fn available<T: Send + Sync + 'static>(value: T) -> ValueRef {
        Self::allocate(State::Constructed, Payload::Value(Box::new(value)))
    }

    /// An already-available error value.
    pub fn error(diagnostic: Diagnostic) -> ValueRef {
        Self::allocate(State::Error, Payload::Error(Arc::new(diagnostic)))
    }

    /// An empty concrete value, completed later with
    /// [`set_value`](AsyncValue::set_value) or
    /// [`set_error`](AsyncValue::set_error).
    pub fn unconstructed() -> ValueRef {
        Self::allocate(State::Unconstructed, Payload::Empty)
    }

    /// An unresolved indirect value, resolved later with
    /// [`forward_to`](AsyncValue::forward_to).
    pub fn indirect() -> ValueRef {
        Self::allocate(State::UnresolvedIndirect, Payload::Empty)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn is_error(&self) -> bool {
        self.state().is_error()
    }

    pub fn is_unresolved_indirect(&self) -> bool {
        self.state() == State::UnresolvedIndirect
    }

    /// Raise the reference count by `count`.
    pub fn add_ref(&self, count: u32) {
        if count == 0 {
            return;
        }
        let prior = self.refcount.fetch_add(count, Ordering::Relaxed);
        debug_assert!(prior > 0, "add_ref on a dead async value");
    }

    /// Release `count` references, deallocating the cell when the last one
    /// goes.
    ///
    /// # Safety
    ///
    /// The caller must own `count` references. `self` may be deallocated by
    /// this call and must not be touched afterwards.
    pub unsafe fn drop_ref(&self, count: u32) {
        if count == 0 {
            return;
        }
        let prior = self.refcount.fetch_sub(count, Ordering::Release);
        debug_assert!(prior >= count, "async value refcount underflow");
        if prior == count {
            // Synchronize with all prior releases before tearing down.
            fence(Ordering::Acquire);
            drop(unsafe { Box::from_raw(self as *const AsyncValue as *mut AsyncValue) });
        }
    }

    /// Construct the payload of an unconstructed value, waking waiters.
    pub fn set_value<T: Send + Sync + 'static>(&self, value: T) {
        debug_assert_eq!(self.state(), State::Unconstructed);
        self.complete(State::Constructed, Payload::Value(Box::new(value)));
    }

    /// Complete the value with an error, waking waiters.
    pub fn set_error(&self, diagnostic: Diagnostic) {
        debug_assert!(!self.is_available(), "async value completed twice");
        self.complete(State::Error, Payload::Error(Arc::new(diagnostic)));
    }

    fn complete(&self, state: State, payload: Payload) {
        debug_assert!(state.is_available());
        let waiters = {
            let mut waiters = self.waiters.lock();
            debug_assert!(!self.is_available(), "async value completed twice");
            // SAFETY: the payload is only ever written here, under the waiter
            // lock, while the state is still unavailable. Readers only touch
            // it after an acquire load observes the release store below.
            unsafe { *self.payload.get() = payload };
            self.state.store(state as u8, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        // Run continuations outside the lock; they may re-enter this value.
        for waiter in waiters {
            waiter();
        }
    }

    /// Run `waiter` once the value is available; inline if it already is.
    ///
    /// Continuations run on whichever thread completes the value, so they
    /// must be `Send`.
    pub fn and_then(&self, waiter: impl FnOnce() + Send + 'static) {
        if self.is_available() {
            waiter();
            return;
        }
        let raced = {
            let mut waiters = self.waiters.lock();
            if self.is_available() {
                // Completed between the fast-path check and taking the lock.
                Some(waiter)
            } else {
                waiters.push(Box::new(waiter));
                None
            }
        };
        if let Some(waiter) = raced {
            waiter();
        }
    }

    /// Resolve this indirect value to `target`, adopting its outcome once
    /// `target` is available. Consumes the caller's reference to `target`.
    pub fn forward_to(&self, target: ValueRef) {
        debug_assert!(self.is_unresolved_indirect(), "forward_to on a non-indirect value");
        if target.is_available() {
            self.adopt(target);
            return;
        }
        let this = ValueRef::form_ref(self);
        let observed = target.clone();
        observed.and_then(move || this.adopt(target));
    }

    fn adopt(&self, target: ValueRef) {
        debug_assert!(target.is_available());
        let state = if target.is_error() { State::Error } else { State::ConcreteIndirect };
        self.complete(state, Payload::Forward(target));
    }

    fn resolved_payload(&self) -> &Payload {
        assert!(self.is_available(), "reading an unavailable async value");
        // SAFETY: available values have an immutable payload, and the acquire
        // load above synchronizes with the completing release store. Forward
        // targets are available by construction (see `adopt`).
        let mut payload = unsafe { &*self.payload.get() };
        while let Payload::Forward(target) = payload {
            debug_assert!(target.is_available());
            payload = unsafe { &*target.payload.get() };
        }
        payload
    }

    /// Typed access to the constructed payload, chasing forward chains.
    ///
    /// Panics if the value is unavailable, an error, or of a different type;
    /// those are kernel contract violations, not runtime conditions.
    pub fn get<T: 'static>(&self) -> &T {
        match self.resolved_payload() {
            Payload::Value(value) => {
                value.downcast_ref::<T>().expect("async value payload type mismatch")
            }
            _ => panic!("get() on an async value without a constructed payload"),
        }
    }

    /// The diagnostic of an error value, chasing forward chains.
    pub fn diagnostic(&self) -> &Diagnostic {
        match self.resolved_payload() {
            Payload::Error(diagnostic) => diagnostic,
            _ => panic!("diagnostic() on a non-error async value"),
        }
    }
}

impl fmt::Debug for AsyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncValue")
            .field("state", &self.state())
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish()
    }
}

/// Owning handle over one reference to an [`AsyncValue`].
pub struct ValueRef {
    ptr: NonNull<AsyncValue>,
}

// SAFETY: AsyncValue is Send + Sync and the handle only moves a pointer.
unsafe impl Send for ValueRef {}
unsafe impl Sync for ValueRef {}

impl ValueRef {
    /// A new handle over an additional reference to `value`.
    pub fn form_ref(value: &AsyncValue) -> ValueRef {
        value.add_ref(1);
        ValueRef { ptr: NonNull::from(value) }
    }

    /// Wrap a raw pointer, taking over one existing reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live [`AsyncValue`] and the caller must own one
    /// of its references, which this handle assumes.
    pub unsafe fn from_raw(ptr: *const AsyncValue) -> ValueRef {
        debug_assert!(!ptr.is_null());
        ValueRef { ptr: unsafe { NonNull::new_unchecked(ptr.cast_mut()) } }
    }

    /// Release ownership of the handle's reference, returning the raw cell.
    pub fn into_raw(self) -> *const AsyncValue {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    pub fn as_ptr(&self) -> *const AsyncValue {
        self.ptr.as_ptr()
    }
}

impl std::ops::Deref for ValueRef {
    type Target = AsyncValue;

    fn deref(&self) -> &AsyncValue {
        // SAFETY: the handle owns a reference, so the cell is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ValueRef {
    fn clone(&self) -> ValueRef {
        ValueRef::form_ref(self)
    }
}

impl Drop for ValueRef {
    fn drop(&mut self) {
        // SAFETY: the handle owns exactly one reference.
        unsafe { self.ptr.as_ref().drop_ref(1) };
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
