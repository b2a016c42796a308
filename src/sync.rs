// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! Condition variables and mutexes (spec component C7), grounded on
//! st-srs's `sync.c`. Both primitives wake waiters strictly FIFO by wait
//! queue order (spec.md §5's ordering guarantees) and integrate with the
//! sleep heap (for `cond_timedwait`) and the interrupt flag (for
//! cancellation) exactly as spec.md §4.7 describes.
//!
//! Methods take `&self` with an inner [`UnsafeCell`] rather than `&mut
//! self`: a coroutine that suspends inside `lock`/`wait` keeps its call
//! frame (and whatever borrow it holds) alive but not running, while a
//! *different* coroutine's frame calls back into the same `Mutex`/`CondVar`
//! through its own reference. Two live `&mut` borrows of one allocation at
//! once — even if never executing concurrently — is unsound; every other
//! intrusive structure in this crate (the run queue, the sleep heap) makes
//! the same trade for the same reason.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::time::Duration;

use crate::clist::Link;
use crate::coroutine::{Coroutine, CoroutineRef, State};
use crate::error::{StError, StResult};
use crate::vp;

fn wait_q_ptr(head: &mut Link) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(head as *mut Link) }
}

unsafe fn coroutine_of_wait_link(link: NonNull<Link>) -> CoroutineRef {
    let offset = std::mem::offset_of!(Coroutine, wait_link);
    unsafe { NonNull::new_unchecked(link.as_ptr().cast::<u8>().sub(offset).cast::<Coroutine>()) }
}

/// Unlink ourselves from a wait queue if we're still on it. A signal/wake
/// already unlinks; this only matters on the timeout/interrupt paths.
fn unlink_self(me: CoroutineRef) {
    let wl = vp::wait_link_of(me);
    unsafe {
        if !Link::is_empty(wl) {
            Link::remove(wl);
        }
    }
}

// ---------------------------------------------------------------- CondVar

struct CondVarInner {
    wait_q: Link,
}

/// A condition variable (spec.md §4.7, §6's `cond_*` API).
pub struct CondVar {
    inner: UnsafeCell<CondVarInner>,
}

impl CondVar {
    pub fn new() -> Box<CondVar> {
        let mut b = Box::new(CondVar { inner: UnsafeCell::new(CondVarInner { wait_q: Link::new() }) });
        let head = unsafe { &mut (*b.inner.get()).wait_q };
        unsafe { Link::init(wait_q_ptr(head)) };
        b
    }

    /// Wait forever for a signal or interrupt.
    ///
    /// # Errors
    /// [`StError::Interrupted`] if this coroutine's interrupt flag fires
    /// while waiting.
    pub fn wait(&self) -> StResult<()> {
        self.timedwait(None)
    }

    /// Wait for a signal, interrupt, or `timeout` to elapse.
    ///
    /// # Errors
    /// [`StError::TimedOut`] if `timeout` elapses first;
    /// [`StError::Interrupted`] if the interrupt flag fires first.
    pub fn timedwait(&self, timeout: Option<Duration>) -> StResult<()> {
        let me = vp::current();
        let head = unsafe { &mut (*self.inner.get()).wait_q };
        unsafe { Link::insert_before(vp::wait_link_of(me), wait_q_ptr(head)) };

        vp::sleep_q_add(me, timeout);
        vp::block_current(State::CondWait);

        unlink_self(me);
        if timeout.is_some() {
            vp::sleep_q_remove(me);
        }

        let timed_out = crate::vp::was_timed_out(me);
        vp::clear_timed_out(me);
        if timed_out {
            return Err(StError::TimedOut);
        }
        if crate::vp::take_interrupt(me) {
            return Err(StError::Interrupted);
        }
        Ok(())
    }

    /// Wake the first waiter (FIFO), if any (spec.md §5).
    pub fn signal(&self) {
        self.wake(false);
    }

    /// Wake every current waiter, preserving wait-queue order onto the run
    /// queue (spec.md §5).
    pub fn broadcast(&self) {
        self.wake(true);
    }

    fn wake(&self, all: bool) {
        let head = unsafe { &mut (*self.inner.get()).wait_q };
        let head_ptr = wait_q_ptr(head);
        loop {
            let front = unsafe { Link::front(head_ptr) };
            let Some(link) = front else { break };
            let co = unsafe { coroutine_of_wait_link(link) };
            unsafe { Link::remove(link) };
            vp::sleep_q_remove(co);
            unsafe { (*co.as_ptr()).state = State::Runnable };
            vp::run_queue_push_tail(co);
            if !all {
                break;
            }
        }
    }

    /// Wake-one used internally for the termination condvar every joinable
    /// coroutine owns (`vp::finish_current`). Takes a raw pointer since
    /// `vp.rs` only ever has `Coroutine::term`'s `Box<CondVar>` as
    /// `*const CondVar` at that call site.
    pub(crate) unsafe fn signal_one_raw(cv: *mut CondVar) {
        unsafe { (*cv).signal() };
    }
}

/// spec.md §7 treats destroying a mutex/condvar with waiters parked on it as
/// misuse (`EBUSY`). Rust has no fallible destructor, and the ownership
/// model means a `Box<CondVar>`/`Box<Mutex>` only ever drops once nothing
/// else references it — but a waiter's `wait_link` points at the queue head
/// by raw pointer, not through the borrow checker, so a drop while waiters
/// are still linked in would free memory they're still threaded through.
/// Panicking here is the Rust-idiomatic rendering of that `EBUSY`: it's a
/// programming error, not a recoverable runtime condition.
impl Drop for CondVar {
    fn drop(&mut self) {
        let head = unsafe { &mut (*self.inner.get()).wait_q };
        assert!(Link::is_empty(wait_q_ptr(head)), "dropped a CondVar with coroutines still waiting on it");
    }
}

impl Default for CondVar {
    fn default() -> Self {
        // `Box<CondVar>` is the only supported form (the wait queue head
        // needs a stable address); `Default` exists only to satisfy
        // derives elsewhere that expect it on a value type. Panics if ever
        // actually called.
        unreachable!("CondVar must be constructed via CondVar::new(), which returns a Box")
    }
}

pub(crate) fn condvar_signal_one(cv: *mut CondVar) {
    unsafe { CondVar::signal_one_raw(cv) };
}

/// Used by `vp::thread_join`'s wait loop on a target's termination condvar.
/// Ignores interrupt/timeout outcomes (there is no timeout; an interrupt
/// just causes the loop to re-check the target's state and wait again) —
/// `thread_join` itself isn't specified as interruptible in spec.md §6.
pub(crate) fn condvar_wait_raw(cv: *mut CondVar, timeout: Option<Duration>) {
    let cv = unsafe { &*cv };
    let _ = cv.timedwait(timeout);
}

// ----------------------------------------------------------------- Mutex

struct MutexInner {
    owner: Option<CoroutineRef>,
    wait_q: Link,
}

/// A mutex (spec.md §4.7, §6's `mutex_*` API). Recursive locking by the
/// owner fails with [`StError::Deadlock`] rather than succeeding (st-srs's
/// mutexes are non-recursive).
pub struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

impl Mutex {
    pub fn new() -> Box<Mutex> {
        let mut b = Box::new(Mutex { inner: UnsafeCell::new(MutexInner { owner: None, wait_q: Link::new() }) });
        let head = unsafe { &mut (*b.inner.get()).wait_q };
        unsafe { Link::init(wait_q_ptr(head)) };
        b
    }

    /// # Errors
    /// [`StError::Busy`] if currently owned.
    pub fn trylock(&self) -> StResult<()> {
        let inner = unsafe { &mut *self.inner.get() };
        if inner.owner.is_some() {
            return Err(StError::Busy);
        }
        inner.owner = Some(vp::current());
        Ok(())
    }

    /// # Errors
    /// [`StError::Deadlock`] if the caller already owns this mutex.
    /// [`StError::Interrupted`] if the interrupt flag fires while waiting
    /// and ownership was not already handed to this coroutine (spec.md
    /// §5's race rule: a late interrupt racing a hand-off never leaks the
    /// lock).
    pub fn lock(&self) -> StResult<()> {
        let me = vp::current();
        loop {
            {
                let inner = unsafe { &mut *self.inner.get() };
                if inner.owner.is_none() {
                    inner.owner = Some(me);
                    return Ok(());
                }
                if inner.owner == Some(me) {
                    return Err(StError::Deadlock);
                }
                let head = wait_q_ptr(&mut inner.wait_q);
                unsafe { Link::insert_before(vp::wait_link_of(me), head) };
            }

            vp::block_current(State::LockWait);

            let inner = unsafe { &mut *self.inner.get() };
            if inner.owner == Some(me) {
                return Ok(());
            }
            // Still not owner: genuinely woken by interrupt (unlock() only
            // ever wakes a waiter by simultaneously making it the owner).
            unlink_self(me);
            if crate::vp::take_interrupt(me) {
                return Err(StError::Interrupted);
            }
            // Spurious wake with neither ownership nor interrupt observed
            // shouldn't happen under single-threaded cooperative
            // scheduling, but loop rather than assume it can't.
        }
    }

    /// # Errors
    /// [`StError::PermissionDenied`] if the caller does not own this mutex.
    pub fn unlock(&self) -> StResult<()> {
        let me = vp::current();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.owner != Some(me) {
            return Err(StError::PermissionDenied);
        }

        let head = wait_q_ptr(&mut inner.wait_q);
        let mut cur = unsafe { (*head.as_ptr()).next.unwrap() };
        let mut next_owner = None;
        while cur != head {
            let co = unsafe { coroutine_of_wait_link(cur) };
            if unsafe { (*co.as_ptr()).state } == State::LockWait {
                next_owner = Some((cur, co));
                break;
            }
            cur = unsafe { (*cur.as_ptr()).next.unwrap() };
        }

        match next_owner {
            Some((link, co)) => {
                unsafe { Link::remove(link) };
                inner.owner = Some(co);
                unsafe { (*co.as_ptr()).state = State::Runnable };
                vp::run_queue_push_tail(co);
            }
            None => inner.owner = None,
        }
        Ok(())
    }

    /// `true` if `self` is currently held by any coroutine.
    pub fn is_locked(&self) -> bool {
        unsafe { (*self.inner.get()).owner.is_some() }
    }
}

/// See [`CondVar`]'s `Drop` impl: spec.md §7's "destroying a mutex with
/// waiters (EBUSY)" misuse case, rendered as a panic since Rust's destructor
/// can't return a `Result`.
impl Drop for Mutex {
    fn drop(&mut self) {
        let inner = unsafe { &mut *self.inner.get() };
        assert!(Link::is_empty(wait_q_ptr(&mut inner.wait_q)), "dropped a Mutex with coroutines still waiting on it");
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in `tests/sync_test.rs`: constructing a
    // `Mutex`/`CondVar` outside a running VP has nothing meaningful to
    // assert on its own (`vp::current()` panics without `st_init`), so
    // unit coverage here is limited to what doesn't need a scheduler.
    use super::*;

    #[test]
    fn fresh_mutex_is_unlocked() {
        let m = Mutex::new();
        assert!(!m.is_locked());
    }

    #[test]
    fn dropping_a_mutex_with_a_waiter_panics() {
        // Link a bare `Coroutine`-shaped `wait_link` onto the mutex's wait
        // queue directly, without going through a running VP, to exercise
        // the `Drop` assertion in isolation.
        let mut waiter = Link::new();
        let waiter_ptr = unsafe { NonNull::new_unchecked(&mut waiter as *mut Link) };
        unsafe { Link::init(waiter_ptr) };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let m = Mutex::new();
            let head = unsafe { &mut (*m.inner.get()).wait_q };
            unsafe { Link::insert_before(waiter_ptr, wait_q_ptr(head)) };
            drop(m);
        }));
        assert!(result.is_err());
        // `m`'s wait-queue head was on the panicking closure's stack and is
        // gone after unwinding; `waiter`'s links now dangle and must not be
        // touched again (no `Link::remove` here — it has no `Drop` of its
        // own, so simply letting it go out of scope is safe).
    }

    #[test]
    fn dropping_a_condvar_with_a_waiter_panics() {
        let mut waiter = Link::new();
        let waiter_ptr = unsafe { NonNull::new_unchecked(&mut waiter as *mut Link) };
        unsafe { Link::init(waiter_ptr) };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let cv = CondVar::new();
            let head = unsafe { &mut (*cv.inner.get()).wait_q };
            unsafe { Link::insert_before(waiter_ptr, wait_q_ptr(head)) };
            drop(cv);
        }));
        assert!(result.is_err());
    }
}
