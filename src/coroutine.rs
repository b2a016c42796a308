// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The coroutine control block and its lifecycle states.
//!
//! Grounded on st-srs's `_st_thread_t` (`common.h`). Per `SPEC_FULL.md` §12
//! (resolving spec.md §9's Open Question), the record is a plain heap
//! allocation (`Box<Coroutine>`) rather than living atop its own stack: we
//! hand the scheduler a raw [`CoroutineRef`] (a `NonNull<Coroutine>`) and
//! let the intrusive lists thread through it, exactly as the C code threads
//! through a self-hosted struct, just without the "my own stack holds my own
//! metadata" trick C needs and Rust doesn't.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;

use crate::clist::Link;
use crate::key::KEYS_MAX;
use crate::stack::Stack;
use crate::sync::CondVar;

/// A raw handle to a live coroutine. Valid for as long as the coroutine
/// hasn't been reaped (freed after being joined, or immediately on exit if
/// not joinable).
pub type CoroutineRef = NonNull<Coroutine>;

/// The function a coroutine runs. Argument and return value are both
/// type-erased (`Box<dyn Any>`), mirroring `void *(*)(void *)` in the C
/// original; callers downcast on `join`.
pub type ThreadStart = Box<dyn FnOnce() -> Box<dyn Any>>;

/// A tiny hand-rolled bitflags substitute: the crate's flag sets are one
/// byte wide and never need more than `bitflags!`'s basic operators, so we
/// avoid pulling in the `bitflags` crate for a handful of `u8` constants.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: $name = $name($value);
            )*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// Per-coroutine flags, `_ST_FL_*` in the original.
    pub struct Flags: u8 {
        /// The VP's own bootstrap coroutine; never runs user code, never
        /// exits, always joinable-unaware.
        const PRIMORDIAL  = 1 << 0;
        /// Linked into the timeout heap right now.
        const ON_SLEEPQ   = 1 << 2;
        /// An interrupt is pending; deliver it at the next suspension point
        /// (or immediately, if already suspended).
        const INTERRUPT   = 1 << 3;
        /// The most recent wait was woken by timeout rather than by signal.
        const TIMED_OUT   = 1 << 4;
    }
}

/// Coarse scheduling state. Unlike the C original (which infers state from
/// which queue a thread sits on plus its flags), we track it explicitly: it
/// costs one field and removes a whole class of "which queue is this on
/// again" bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Runnable,
    Running,
    /// Waiting for `poll`/`select` readiness, optionally also on the sleep
    /// heap for a timeout.
    IoWait,
    /// Waiting to acquire a [`crate::sync::Mutex`].
    LockWait,
    /// Waiting on a [`CondVar`], optionally also on the sleep heap.
    CondWait,
    /// Sleeping until a due time with no other wait condition.
    Sleeping,
    /// `usleep`/`sleep` called with the no-timeout sentinel: off the sleep
    /// heap entirely, woken only by `thread_interrupt` (spec.md §3/§4.7).
    Suspended,
    /// Has run to completion; resources held until a joiner collects the
    /// return value (joinable) or until the scheduler reaps it (not).
    Zombie,
}

/// Per-key storage slot: the boxed value plus a reference to the process's
/// key table entry so exit-time cleanup can invoke its destructor (see
/// [`crate::key`]).
pub struct KeySlot {
    pub value: Option<Box<dyn Any>>,
}

impl Default for KeySlot {
    fn default() -> Self {
        KeySlot { value: None }
    }
}

/// The coroutine control block.
///
/// `#[repr(C)]` so that [`crate::vp`] and [`crate::sync`] may recover a
/// `CoroutineRef` from a `NonNull<Link>` pointing at one of the embedded
/// link fields by subtracting `offset_of!`, which requires a layout the
/// compiler has committed to (field order is otherwise unspecified under
/// the default Rust repr).
#[repr(C)]
pub struct Coroutine {
    /// Link for whichever single-membership queue this coroutine is
    /// currently on (run queue or zombie queue). A coroutine is on at most
    /// one of these at a time.
    pub link: Link,
    /// Secondary link for mutex/condvar wait queues, which a coroutine can
    /// occupy simultaneously with being on the sleep heap.
    pub wait_link: Link,

    pub state: State,
    pub flags: Flags,

    /// `None` while running (the live register state *is* the execution);
    /// `Some` while suspended, holding the point to resume at.
    pub context: Option<context::Context>,
    /// `None` only for the primordial bootstrap coroutine, which runs on
    /// the OS thread's own stack. (The idle loop of spec.md §4.6 is not a
    /// `Coroutine` in this implementation at all — see
    /// [`crate::vp`]'s module docs for why.)
    pub stack: Option<Stack>,

    start: Option<ThreadStart>,
    pub retval: Option<Box<dyn Any>>,

    /// Absolute wakeup time in microseconds since an arbitrary epoch,
    /// valid only while `flags.contains(ON_SLEEPQ)`.
    pub due: u64,
    pub heap_index: u32,
    pub left: Option<CoroutineRef>,
    pub right: Option<CoroutineRef>,

    /// Present iff this coroutine was created joinable; signaled once on
    /// exit, consumed by exactly one `thread_join`.
    pub term: Option<Box<CondVar>>,
    pub joinable: bool,
    /// `true` once some coroutine has committed to joining this one
    /// (`vp::thread_join`'s "only one joiner at a time" rule, spec.md §4.7).
    pub joining: bool,

    pub keys: [KeySlot; KEYS_MAX],

    /// Set while `state == IoWait`: the poll request currently representing
    /// this coroutine's interest on the VP's I/O queue. Lets
    /// [`crate::vp::thread_interrupt`] find and fully deregister the
    /// pending kernel interest (spec.md §8 scenario 5) without the event
    /// backend needing to expose a reverse lookup.
    pub io_req: Option<NonNull<crate::event::PollRequest>>,

    name: Option<String>,
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("name", &self.name)
            .finish()
    }
}

impl Coroutine {
    pub fn new(start: ThreadStart, stack: Stack, joinable: bool, name: Option<String>) -> Box<Coroutine> {
        Box::new(Coroutine {
            link: Link::new(),
            wait_link: Link::new(),
            state: State::Runnable,
            flags: Flags::empty(),
            context: None,
            stack: Some(stack),
            start: Some(start),
            retval: None,
            due: 0,
            heap_index: 0,
            left: None,
            right: None,
            term: if joinable { Some(CondVar::new()) } else { None },
            joinable,
            joining: false,
            keys: std::array::from_fn(|_| KeySlot::default()),
            io_req: None,
            name,
        })
    }

    /// The primordial bootstrap coroutine: no stack of its own and no start
    /// function, since the scheduler never resumes it through the usual
    /// trampoline — it's just a control-block anchor for "the OS thread
    /// itself is currently here."
    pub fn new_bootstrap(flags: Flags, name: &str) -> Box<Coroutine> {
        Box::new(Coroutine {
            link: Link::new(),
            wait_link: Link::new(),
            state: State::Running,
            flags,
            context: None,
            stack: None,
            start: None,
            retval: None,
            due: 0,
            heap_index: 0,
            left: None,
            right: None,
            term: None,
            joinable: false,
            joining: false,
            keys: std::array::from_fn(|_| KeySlot::default()),
            io_req: None,
            name: Some(name.to_string()),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Take the start closure so the context trampoline can call it exactly
    /// once. Panics if called twice; the scheduler only ever calls this
    /// from the coroutine's first resumption.
    pub fn take_start(&mut self) -> ThreadStart {
        self.start.take().expect("coroutine start function already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_insert_remove_contains() {
        let mut f = Flags::empty();
        assert!(!f.contains(Flags::INTERRUPT));
        f.insert(Flags::INTERRUPT);
        assert!(f.contains(Flags::INTERRUPT));
        f.insert(Flags::ON_SLEEPQ);
        assert!(f.contains(Flags::ON_SLEEPQ));
        f.remove(Flags::INTERRUPT);
        assert!(!f.contains(Flags::INTERRUPT));
        assert!(f.contains(Flags::ON_SLEEPQ));
    }

    #[test]
    fn bootstrap_coroutine_has_no_stack_or_start() {
        let co = Coroutine::new_bootstrap(Flags::PRIMORDIAL, "primordial");
        assert!(co.stack.is_none());
        assert!(co.flags.contains(Flags::PRIMORDIAL));
    }
}
