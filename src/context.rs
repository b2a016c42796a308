// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The machine-dependent context switch primitive (spec component C3).
//!
//! st-srs hand-writes this per ISA (`_st_md_cxt_save`/`_st_md_cxt_restore`,
//! a handful of `md.h` asm stubs) plus a generic C trampoline
//! (`_st_thread_main`) that every new thread's saved context points at. We
//! get the save/restore half from the `context` crate (the same
//! stack-switching primitive coio-rs and mioco build their schedulers on)
//! and keep only the trampoline and the "what do I do with the other side
//! of the switch" bookkeeping, which is genuinely this crate's concern
//! either way.
//!
//! The one invariant callers must preserve, matching spec.md's Design
//! Notes: never inline across a context switch. `context::Context::resume`
//! is an opaque FFI-ish call (implemented in hand-written assembly behind
//! the crate boundary), so the optimizer already can't see through it —
//! we don't need `#[inline(never)]`/a volatile fence ourselves, we just
//! must not try to cache a value across `resume()` in a register by hand.

use std::any::Any;
use std::cell::RefCell;

use context::{Context, Transfer};

use crate::coroutine::Coroutine;
use crate::stack::Stack;

thread_local! {
    /// The point to jump back to in order to return control to this OS
    /// thread's scheduler loop, valid only while a coroutine is actually
    /// running. Swapped out and back in by [`suspend_current`], which is
    /// the only thing that ever touches it from coroutine-body code.
    static RETURN_CTX: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Build the initial machine context for a brand-new coroutine: its stack
/// pointer starts at `stack.top()`, and its first instruction is
/// [`trampoline`].
///
/// # Safety
/// `stack` must outlive the returned `Context` and must not be reused by
/// any other context while this one is alive.
pub unsafe fn new_context(stack: &Stack) -> Context {
    unsafe { Context::new(stack, trampoline) }
}

/// Like [`new_context`] but with a caller-chosen entry point. Used once,
/// by `vp::ensure_scheduler_started`, to bootstrap the per-VP scheduler
/// coroutine on its own dedicated entry ([`crate::vp::scheduler_trampoline`])
/// rather than the ordinary per-user-coroutine [`trampoline`].
///
/// # Safety
/// Same requirements as [`new_context`].
pub unsafe fn new_context_with(stack: &Stack, entry: extern "C" fn(Transfer) -> !) -> Context {
    unsafe { Context::new(stack, entry) }
}

/// Resume `ctx`, handing it `data` verbatim (read only by [`trampoline`]
/// on a coroutine's very first resumption; ignored on every later one,
/// since by then the coroutine is resuming from inside [`suspend_current`]
/// which already has everything it needs). Returns the context to use the
/// *next* time this coroutine should run.
pub fn switch_to(ctx: Context, data: usize) -> Context {
    let transfer = ctx.resume(data);
    transfer.context
}

/// One-time hand-off from the primordial coroutine to a freshly created
/// scheduler context, used exactly once per OS thread by
/// [`crate::vp::block_current`]'s bootstrap path. Ordinary coroutines
/// never call this — they already have `RETURN_CTX` populated by
/// [`trampoline`] and use [`suspend_current`] instead.
pub fn bootstrap_switch(to: Context) {
    let transfer = to.resume(0);
    RETURN_CTX.with(|cell| *cell.borrow_mut() = Some(transfer.context));
}

/// Suspend the calling coroutine, returning control to whichever
/// `switch_to` call last resumed it. Resumes right here, transparently to
/// the caller, the next time the scheduler resumes this coroutine.
///
/// # Panics
/// Panics if called from outside a coroutine body (i.e. from the
/// scheduler's own OS-thread stack).
pub fn suspend_current() {
    RETURN_CTX.with(|cell| {
        let ctx = cell
            .borrow_mut()
            .take()
            .expect("suspend_current called outside a running coroutine");
        let transfer = ctx.resume(0);
        *cell.borrow_mut() = Some(transfer.context);
    });
}

/// Entry point for every freshly created coroutine's machine context.
/// Runs exactly once per coroutine: takes its start closure, executes it,
/// stashes the return value, and falls into the scheduler's exit
/// bookkeeping. Never returns — the final switch lands on a context this
/// coroutine's stack is about to be reclaimed out from under, so nothing
/// is ever allowed to resume back into it.
extern "C" fn trampoline(t: Transfer) -> ! {
    RETURN_CTX.with(|cell| *cell.borrow_mut() = Some(t.context));

    let co_ptr = t.data as *mut Coroutine;
    // SAFETY: `co_ptr` was handed to us by `vp::spawn`/`vp::dispatch` as
    // the exact coroutine this context belongs to, and nothing else holds
    // a live reference to it while it's running.
    let start = unsafe { (*co_ptr).take_start() };

    let retval: Box<dyn Any> = start();

    crate::vp::finish_current(co_ptr, retval);

    // `finish_current` performs the final `suspend_current`-style switch
    // and never returns; this is unreachable defense-in-depth only.
    unreachable!("coroutine resumed after finishing");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    #[test]
    fn switch_to_enters_trampoline_and_returns() {
        let stack = Stack::new(0, false, false).unwrap();

        // A minimal coroutine body that just records it ran and suspends
        // once, via a thread-local flag rather than `vp::finish_current`
        // (which needs a real Coroutine and scheduler state we don't have
        // in this unit test).
        thread_local! { static RAN: RefCell<bool> = const { RefCell::new(false) }; }

        extern "C" fn body(t: Transfer) -> ! {
            RETURN_CTX.with(|cell| *cell.borrow_mut() = Some(t.context));
            RAN.with(|r| *r.borrow_mut() = true);
            suspend_current();
            loop {
                suspend_current();
            }
        }

        let ctx = unsafe { Context::new(&stack, body) };
        let ctx = switch_to(ctx, 0);
        assert!(RAN.with(|r| *r.borrow()));
        drop(ctx);
    }
}
