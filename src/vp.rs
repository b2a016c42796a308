// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The per-OS-thread virtual processor: run queue, sleep heap, dispatch
//! loop and the public scheduling operations built on top of them (spec
//! component C6). Grounded on st-srs's `sched.c`.
//!
//! # The dispatch loop, and why it looks different from the C original
//!
//! st-srs's `_ST_SWITCH_CONTEXT(me)` macro is `setjmp(me->context); if
//! (resumed) return; _st_vp_schedule();` — an *asymmetric* save-then-jump
//! that can be issued from any call depth and discards the caller's C
//! stack frames on the way out. The `context` crate gives us a
//! *symmetric* primitive instead (`Context::resume` both jumps to a target
//! and hands the jumper a fresh `Context` representing "whoever jumps back
//! here"), which can't replicate "capture my own continuation by calling
//! into someone else" directly.
//!
//! We resolve this by giving each VP a dedicated scheduler coroutine (own
//! small stack, own trampoline entry) that is the *only* thing that ever
//! resumes another coroutine. Every blocking primitive (sleep, mutex wait,
//! cond wait, I/O wait, yield) funnels through [`block_current`], which
//! does its own queue bookkeeping and then suspends into the scheduler via
//! [`crate::context::suspend_current`]. The scheduler coroutine is
//! bootstrapped lazily, on the first ever blocking call on this OS thread
//! (necessarily made by the primordial coroutine, since nothing else can
//! be running before a scheduler exists to have dispatched it).

use std::any::Any;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::time::Duration;

use context::{Context, Transfer};

use crate::clist::Link;
use crate::coroutine::{Coroutine, CoroutineRef, Flags, State, ThreadStart};
use crate::error::{StError, StResult};
use crate::event::{EventBackend, EventSysSelector, IoQueue, PollRequest};
use crate::heap::{take_expired, SleepHeap};
use crate::stack::{Stack, StackAllocator};
use crate::time;

const SCHEDULER_STACK_SIZE: usize = 32 * 1024;

#[cfg(feature = "stats")]
#[derive(Debug, Default, Clone, Copy)]
pub struct VpStats {
    pub dispatches: u64,
    pub yields: u64,
    pub idle_polls: u64,
    pub wakeups_timeout: u64,
    pub wakeups_signal: u64,
}

type SwitchInCb = Box<dyn Fn(CoroutineRef)>;
type SwitchOutCb = Box<dyn Fn(CoroutineRef)>;

pub struct VpState {
    run_q: Link,
    zombie_q: Link,
    sleep_heap: SleepHeap,
    pub io_q: IoQueue,

    current: Option<CoroutineRef>,
    primordial: Option<CoroutineRef>,

    scheduler_ctx: Option<Context>,
    scheduler_stack: Option<Stack>,
    scheduler_started: bool,

    pub stack_alloc: StackAllocator,
    pub event: Box<dyn EventBackend>,
    pub eventsys: EventSysSelector,

    pub last_clock: u64,

    switch_in_cb: Option<SwitchInCb>,
    switch_out_cb: Option<SwitchOutCb>,

    #[cfg(feature = "stats")]
    pub stats: VpStats,
}

impl VpState {
    fn new() -> Self {
        let eventsys = EventSysSelector::Default;
        VpState {
            run_q: Link::new(),
            zombie_q: Link::new(),
            sleep_heap: SleepHeap::new(),
            io_q: IoQueue::new(),
            current: None,
            primordial: None,
            scheduler_ctx: None,
            scheduler_stack: None,
            scheduler_started: false,
            stack_alloc: StackAllocator::new(),
            event: crate::event::build_backend(eventsys),
            eventsys,
            last_clock: time::utime_now(),
            switch_in_cb: None,
            switch_out_cb: None,
            #[cfg(feature = "stats")]
            stats: VpStats::default(),
        }
    }
}

thread_local! {
    static VP: RefCell<VpState> = RefCell::new(VpState::new());
}

fn with_vp<R>(f: impl FnOnce(&mut VpState) -> R) -> R {
    VP.with(|cell| f(&mut cell.borrow_mut()))
}

fn link_of(co: CoroutineRef) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(&mut (*co.as_ptr()).link as *mut Link) }
}

fn run_q_head(vp: &mut VpState) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(&mut vp.run_q as *mut Link) }
}

fn zombie_q_head(vp: &mut VpState) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(&mut vp.zombie_q as *mut Link) }
}

/// One-time per-OS-thread initialization (`st_init`). Idempotent: calling
/// it again on an already-initialized thread is a no-op, matching
/// `st_init`'s documented behavior of returning success if already called.
pub fn st_init() -> StResult<()> {
    with_vp(|vp| {
        unsafe {
            Link::init(run_q_head(vp));
            Link::init(zombie_q_head(vp));
            vp.io_q.init();
        }
        if vp.primordial.is_none() {
            let primordial = Coroutine::new_bootstrap(Flags::PRIMORDIAL, "primordial");
            let ptr = NonNull::new(Box::into_raw(primordial)).unwrap();
            vp.primordial = Some(ptr);
            vp.current = Some(ptr);
            crate::event::raise_fd_limit();
        }
        tracing::debug!(backend = vp.event.name(), "state_threads VP initialized");
        Ok(())
    })
}

pub fn current() -> CoroutineRef {
    with_vp(|vp| vp.current.expect("current() called before st_init"))
}

pub fn set_eventsys(sel: EventSysSelector) -> StResult<()> {
    with_vp(|vp| {
        if vp.scheduler_started {
            // st-srs only allows this before the VP has started dispatching.
            return Err(StError::InvalidArgument);
        }
        vp.eventsys = sel;
        vp.event = crate::event::build_backend(sel);
        Ok(())
    })
}

pub fn randomize_stacks(enabled: bool) {
    with_vp(|vp| vp.stack_alloc.randomize = enabled);
}

pub fn set_switch_in_cb(cb: Option<SwitchInCb>) {
    with_vp(|vp| vp.switch_in_cb = cb);
}

pub fn set_switch_out_cb(cb: Option<SwitchOutCb>) {
    with_vp(|vp| vp.switch_out_cb = cb);
}

#[cfg(feature = "stats")]
pub fn stats_snapshot() -> VpStats {
    with_vp(|vp| vp.stats)
}

/// Create a new coroutine, runnable immediately (pushed to the run queue
/// tail). `stack_size` of 0 uses the default.
pub fn thread_create<F, T>(stack_size: usize, joinable: bool, name: Option<String>, f: F) -> StResult<CoroutineRef>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let start: ThreadStart = Box::new(move || Box::new(f()) as Box<dyn Any>);
    with_vp(|vp| {
        let stack = vp.stack_alloc.alloc(stack_size)?;
        let mut co = Coroutine::new(start, stack, joinable, name);
        // SAFETY: the stack was just allocated and lives inside `co`,
        // which we immediately box to a stable heap address below; no
        // other reference to it exists yet.
        let ctx = unsafe { crate::context::new_context(co.stack.as_ref().unwrap()) };
        co.context = Some(ctx);
        let ptr = NonNull::new(Box::into_raw(co)).unwrap();
        unsafe { Link::insert_before(link_of(ptr), run_q_head(vp)) };
        tracing::trace!(?ptr, "coroutine created");
        Ok(ptr)
    })
}

fn pop_run_queue(vp: &mut VpState) -> Option<CoroutineRef> {
    unsafe {
        let head = run_q_head(vp);
        let front = Link::front(head)?;
        Link::remove(front);
        Some(coroutine_of_link(front))
    }
}

unsafe fn coroutine_of_link(link: NonNull<Link>) -> CoroutineRef {
    // `offset_of!` rather than a bare `.cast()`: `Coroutine` is `#[repr(C)]`
    // but nothing requires `link` be its first field, so we ask the
    // compiler for the real offset instead of assuming layout. Mirrors
    // st-srs's `_ST_THREAD_PTR` container-of macro.
    let offset = std::mem::offset_of!(Coroutine, link);
    unsafe { NonNull::new_unchecked(link.as_ptr().cast::<u8>().sub(offset).cast::<Coroutine>()) }
}

/// Container-of for the secondary `wait_link` field, used by mutex/condvar
/// wait queues (`crate::sync`) and by [`thread_interrupt`] to unlink a
/// waiting coroutine generically, without knowing which kind of wait
/// queue it's on.
pub(crate) fn wait_link_of(co: CoroutineRef) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(&mut (*co.as_ptr()).wait_link as *mut Link) }
}

fn push_run_queue_tail(vp: &mut VpState, co: CoroutineRef) {
    unsafe { Link::insert_before(link_of(co), run_q_head(vp)) };
}

fn push_run_queue_front(vp: &mut VpState, co: CoroutineRef) {
    unsafe { Link::insert_after(link_of(co), run_q_head(vp)) };
}

/// Advance `last_clock` and the time cache, then wake every sleeper whose
/// due time has passed (`_st_vp_check_clock`).
fn check_clock(vp: &mut VpState) {
    let now = time::utime_now();
    vp.last_clock = now;
    time::refresh_cache_if_due(now);

    let expired = take_expired(&mut vp.sleep_heap, now);
    for co in expired {
        unsafe {
            let c = &mut *co.as_ptr();
            c.flags.remove(Flags::ON_SLEEPQ);
            c.flags.insert(Flags::TIMED_OUT);
            // If it was also linked on a mutex/condvar wait queue, the
            // caller (sync.rs's wait primitives) is responsible for
            // unlinking `wait_link` when it observes TIMED_OUT after
            // waking; we only own the sleep heap's bookkeeping here.
            c.state = State::Runnable;
        }
        #[cfg(feature = "stats")]
        with_stats(|s| s.wakeups_timeout += 1);
        // Head-insert: coroutines waking from the sleep heap this dispatch
        // cycle preempt whatever's already queued (spec.md §5/§4.6).
        push_run_queue_front(vp, co);
    }
}

#[cfg(feature = "stats")]
fn with_stats(f: impl FnOnce(&mut VpStats)) {
    with_vp(|vp| f(&mut vp.stats));
}

/// Absolute microsecond due time for `timeout` from now, or `u64::MAX` for
/// "no timeout" (spec.md's negative-timeout sentinel).
pub fn due_time(vp_last_clock: u64, timeout: Option<Duration>) -> u64 {
    match timeout {
        None => u64::MAX,
        Some(d) => vp_last_clock.saturating_add(d.as_micros() as u64),
    }
}

/// Link `co` into the sleep heap with the given absolute due time.
pub fn add_sleep_q(vp: &mut VpState, co: CoroutineRef, due: u64) {
    unsafe {
        (*co.as_ptr()).due = due;
        (*co.as_ptr()).flags.insert(Flags::ON_SLEEPQ);
        vp.sleep_heap.insert(co);
    }
}

pub fn del_sleep_q(vp: &mut VpState, co: CoroutineRef) {
    unsafe {
        if (*co.as_ptr()).flags.contains(Flags::ON_SLEEPQ) {
            vp.sleep_heap.remove(co);
            (*co.as_ptr()).flags.remove(Flags::ON_SLEEPQ);
        }
    }
}

/// The VP's last-sampled clock, in microseconds (`st_utime_last_clock`,
/// spec.md §10's supplemented feature).
pub fn last_clock() -> u64 {
    with_vp(|vp| vp.last_clock)
}

/// Link `co` into the sleep heap for `timeout` from now (`None` = forever,
/// never actually inserted). Thin wrapper over [`add_sleep_q`]/[`due_time`]
/// for callers (`sync.rs`, `netfd.rs`) that only have a `CoroutineRef`, not
/// a `&mut VpState`.
pub(crate) fn sleep_q_add(co: CoroutineRef, timeout: Option<Duration>) {
    if let Some(t) = timeout {
        with_vp(|vp| {
            let due = due_time(vp.last_clock, Some(t));
            add_sleep_q(vp, co, due);
        });
    }
}

pub(crate) fn sleep_q_remove(co: CoroutineRef) {
    with_vp(|vp| del_sleep_q(vp, co));
}

pub(crate) fn run_queue_push_tail(co: CoroutineRef) {
    with_vp(|vp| push_run_queue_tail(vp, co));
}

pub(crate) fn run_queue_push_front(co: CoroutineRef) {
    with_vp(|vp| push_run_queue_front(vp, co));
}

pub(crate) fn clear_timed_out(co: CoroutineRef) {
    unsafe { (*co.as_ptr()).flags.remove(Flags::TIMED_OUT) };
}

/// Register `req` with the VP's event backend and link it onto the I/O
/// queue. Used by `netfd.rs`'s `poll`/`netfd_poll`.
pub(crate) fn io_register(req: NonNull<PollRequest>) -> StResult<()> {
    with_vp(|vp| {
        vp.event.pollset_add(req)?;
        vp.io_q.push_back(req);
        Ok(())
    })
}

/// Undo [`io_register`] for a request that's waking up via timeout or
/// interrupt rather than kernel readiness (the backend already removed it
/// from both its own tables and `io_q` when it delivered readiness).
pub(crate) fn io_deregister(req: NonNull<PollRequest>) {
    with_vp(|vp| {
        vp.event.pollset_del(req);
        vp.io_q.remove(req);
    });
}

pub(crate) fn event_fd_new(fd: std::os::unix::io::RawFd) {
    with_vp(|vp| vp.event.fd_new(fd));
}

pub(crate) fn event_fd_close(fd: std::os::unix::io::RawFd) -> StResult<()> {
    with_vp(|vp| vp.event.fd_close(fd))
}

/// Suspend the current coroutine in `new_state`. The caller must already
/// have performed whatever queue linking that state implies (sleep heap,
/// mutex/condvar wait queue, I/O backend registration, or — for
/// `Runnable`, i.e. a plain yield — re-enqueuing itself onto the run
/// queue tail) before calling this.
pub fn block_current(new_state: State) {
    let me = with_vp(|vp| {
        let me = vp.current.expect("block_current outside a coroutine");
        unsafe { (*me.as_ptr()).state = new_state };
        if let Some(cb) = &vp.switch_out_cb {
            cb(me);
        }
        me
    });

    ensure_scheduler_started();

    let bootstrap_ctx = with_vp(|vp| vp.scheduler_ctx.take());
    match bootstrap_ctx {
        Some(ctx) => crate::context::bootstrap_switch(ctx),
        None => crate::context::suspend_current(),
    }

    with_vp(|vp| {
        vp.current = Some(me);
        unsafe { (*me.as_ptr()).state = State::Running };
        if let Some(cb) = &vp.switch_in_cb {
            cb(me);
        }
    });
}

fn ensure_scheduler_started() {
    with_vp(|vp| {
        if vp.scheduler_started {
            return;
        }
        let stack = Stack::new(SCHEDULER_STACK_SIZE, false, false).expect("failed to allocate scheduler stack");
        let ctx = unsafe { crate::context::new_context_with(&stack, scheduler_trampoline) };
        vp.scheduler_stack = Some(stack);
        vp.scheduler_ctx = Some(ctx);
        vp.scheduler_started = true;
    });
}

/// Entered exactly once per OS thread, via [`block_current`]'s bootstrap
/// path. `t.context` is the primordial coroutine's own continuation,
/// captured by the very act of it resuming us.
pub(crate) extern "C" fn scheduler_trampoline(t: Transfer) -> ! {
    with_vp(|vp| {
        let primordial = vp.primordial.expect("scheduler started before st_init");
        unsafe { (*primordial.as_ptr()).context = Some(t.context) };
    });

    loop {
        reschedule_iteration();
    }
}

fn reschedule_iteration() {
    with_vp(check_clock);

    let next = with_vp(pop_run_queue);
    if let Some(target) = next {
        run_one(target);
        return;
    }

    // Nothing runnable: block in the event backend until the earliest
    // timer fires or a descriptor becomes ready.
    let timeout = with_vp(|vp| {
        if vp.sleep_heap.is_empty() {
            None
        } else {
            let min = vp.sleep_heap.peek_min().unwrap();
            let due = unsafe { (*min.as_ptr()).due };
            Some(due.saturating_sub(vp.last_clock))
        }
    });
    let woken = with_vp(|vp| {
        #[cfg(feature = "stats")]
        {
            vp.stats.idle_polls += 1;
        }
        vp.event.dispatch(&mut vp.io_q, timeout)
    });
    for co in woken {
        unsafe {
            (*co.as_ptr()).io_req = None;
            (*co.as_ptr()).state = State::Runnable;
        }
        #[cfg(feature = "stats")]
        with_stats(|s| s.wakeups_signal += 1);
        with_vp(|vp| {
            del_sleep_q(vp, co);
            push_run_queue_tail(vp, co);
        });
    }
}

fn run_one(target: CoroutineRef) {
    with_vp(|vp| {
        vp.current = Some(target);
        #[cfg(feature = "stats")]
        {
            vp.stats.dispatches += 1;
        }
    });
    unsafe { (*target.as_ptr()).state = State::Running };

    let ctx = unsafe { (*target.as_ptr()).context.take() }.expect("runnable coroutine missing context");
    let data = target.as_ptr() as usize;
    let new_ctx = crate::context::switch_to(ctx, data);
    unsafe { (*target.as_ptr()).context = Some(new_ctx) };
}

/// Give up the rest of the current quantum. Re-enqueues `self` at the run
/// queue tail before suspending, so another runnable coroutine (if any)
/// gets a turn; if none exists this returns almost immediately.
pub fn thread_yield() {
    // spec.md §9's resolved ordering: check the clock first.
    with_vp(check_clock);
    let me = current();
    with_vp(|vp| push_run_queue_tail(vp, me));
    #[cfg(feature = "stats")]
    with_stats(|s| s.yields += 1);
    block_current(State::Runnable);
}

/// Suspend for at least `timeout`, or forever if `None` (spec.md's
/// negative-timeout sentinel — callers translate that at the public API
/// boundary): never woken except by timeout or `thread_interrupt`.
///
/// # Errors
/// [`StError::Interrupted`] if this coroutine's interrupt flag fires
/// before `timeout` elapses.
pub fn sleep(timeout: Option<Duration>) -> StResult<()> {
    let me = current();
    if take_interrupt(me) {
        return Err(StError::Interrupted);
    }

    sleep_q_add(me, timeout);
    block_current(if timeout.is_some() { State::Sleeping } else { State::Suspended });
    sleep_q_remove(me);
    clear_timed_out(me);

    if take_interrupt(me) {
        return Err(StError::Interrupted);
    }
    Ok(())
}

/// Mark `co` interrupted. If it's currently suspended waiting on
/// something, wake it immediately; if it's running or merely runnable,
/// the flag is picked up lazily at its next suspension point
/// (`st_thread_interrupt`).
pub fn thread_interrupt(co: CoroutineRef) {
    unsafe { (*co.as_ptr()).flags.insert(Flags::INTERRUPT) };
    let state = unsafe { (*co.as_ptr()).state };
    if !matches!(state, State::Sleeping | State::Suspended | State::IoWait | State::CondWait | State::LockWait) {
        // Running/runnable: the flag is picked up lazily at the next
        // suspension point. Zombie: no-op per spec.md §4.6.
        return;
    }

    // A coroutine's `wait_link` is generic: whichever wait queue (mutex or
    // condvar) linked it there owns no special knowledge needed to unlink
    // it — it's just splicing neighbors. This lets `thread_interrupt` wake
    // a mutex or condvar waiter without depending on `crate::sync`.
    unsafe {
        let wl = wait_link_of(co);
        if !Link::is_empty(wl) {
            Link::remove(wl);
        }
    }

    if let Some(req) = unsafe { (*co.as_ptr()).io_req.take() } {
        io_deregister(req);
    }

    with_vp(|vp| {
        del_sleep_q(vp, co);
        unsafe { (*co.as_ptr()).state = State::Runnable };
        push_run_queue_front(vp, co);
    });
}

pub(crate) fn take_interrupt(co: CoroutineRef) -> bool {
    unsafe {
        let c = &mut *co.as_ptr();
        if c.flags.contains(Flags::INTERRUPT) {
            c.flags.remove(Flags::INTERRUPT);
            true
        } else {
            false
        }
    }
}

pub(crate) fn was_timed_out(co: CoroutineRef) -> bool {
    unsafe { (*co.as_ptr()).flags.contains(Flags::TIMED_OUT) }
}

/// Terminate the current coroutine early, bypassing the rest of its start
/// function. Never returns.
pub fn thread_exit(retval: Box<dyn Any>) -> ! {
    let me = current();
    finish_current(me.as_ptr(), retval);
    unreachable!("thread_exit resumed after finishing");
}

/// Shared tail for both a coroutine's natural return (via the trampoline)
/// and an explicit `thread_exit` call: stash the return value, run
/// destructors, signal any joiner, and move to the zombie queue — then
/// hand off to the scheduler one final time, never to be resumed.
pub(crate) fn finish_current(co_ptr: *mut Coroutine, retval: Box<dyn Any>) -> ! {
    let co = unsafe { NonNull::new_unchecked(co_ptr) };
    unsafe {
        (*co_ptr).retval = Some(retval);
        (*co_ptr).state = State::Zombie;
        crate::key::run_destructors(&mut (*co_ptr).keys);
    }

    let joinable = unsafe { (*co_ptr).joinable };
    if joinable {
        // The joiner (if any) is woken via the termination condvar; the
        // zombie stays linked until `thread_join` reaps it.
        unsafe {
            if let Some(term) = (*co_ptr).term.as_ref() {
                crate::sync::condvar_signal_one(term.as_ref() as *const _ as *mut crate::sync::CondVar);
            }
        }
        with_vp(|vp| unsafe { Link::insert_before(link_of(co), zombie_q_head(vp)) });
    } else {
        // No one will ever join this coroutine: free it immediately.
        with_vp(|vp| {
            if let Some(stack) = unsafe { (*co_ptr).stack.take() } {
                vp.stack_alloc.free(stack);
            }
        });
        unsafe { drop(Box::from_raw(co_ptr)) };
    }

    tracing::trace!(?co, "coroutine finished");
    crate::context::suspend_current();
    unreachable!("zombie coroutine resumed");
}

/// Block until `target` exits, then return its boxed return value.
///
/// # Errors
/// [`StError::Deadlock`] if `target` is the calling coroutine itself.
/// [`StError::InvalidArgument`] if `target` was not created joinable, or
/// another coroutine is already joining it.
pub fn thread_join(target: CoroutineRef) -> StResult<Box<dyn Any>> {
    if target == current() {
        return Err(StError::Deadlock);
    }
    let joinable = unsafe { (*target.as_ptr()).joinable };
    if !joinable {
        return Err(StError::InvalidArgument);
    }
    if unsafe { (*target.as_ptr()).joining } {
        return Err(StError::InvalidArgument);
    }
    unsafe { (*target.as_ptr()).joining = true };
    loop {
        let state = unsafe { (*target.as_ptr()).state };
        if state == State::Zombie {
            break;
        }
        let term_ptr = unsafe { (*target.as_ptr()).term.as_ref().unwrap().as_ref() as *const _ as *mut crate::sync::CondVar };
        crate::sync::condvar_wait_raw(term_ptr, None);
    }
    with_vp(|vp| unsafe { Link::remove(link_of(target)) });
    let mut boxed = unsafe { Box::from_raw(target.as_ptr()) };
    let retval = boxed.retval.take().unwrap_or_else(|| Box::new(()) as Box<dyn Any>);
    if let Some(stack) = boxed.stack.take() {
        with_vp(|vp| vp.stack_alloc.free(stack));
    }
    Ok(retval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_time_none_is_max() {
        assert_eq!(due_time(1000, None), u64::MAX);
    }

    #[test]
    fn due_time_some_adds_micros() {
        assert_eq!(due_time(1000, Some(Duration::from_millis(5))), 1000 + 5000);
    }
}
