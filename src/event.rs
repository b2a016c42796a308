// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The pluggable I/O-readiness backend (spec component C5), grounded on
//! st-srs's `event.c`. Three backends share one shape: per-descriptor
//! read/write/exception reference counts, a batched add/dispatch/remove
//! cycle against the kernel, and a walk of the VP's I/O queue on every
//! dispatch to match kernel-reported readiness back to waiting
//! [`PollRequest`]s.
//!
//! Unlike the run queue and sleep heap, a backend's own per-descriptor
//! bookkeeping table is *not* threaded through the waiting coroutines
//! themselves (a descriptor can be awaited by several unrelated poll
//! requests at once, so there is no single coroutine to own the count);
//! it is a plain growable table indexed by raw fd, mirroring st-srs's
//! `calloc`/`realloc`'d `fd_data` array.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use crate::clist::Link;
use crate::coroutine::CoroutineRef;
use crate::error::{StError, StResult};

/// `poll()`/`netfd_poll()`'s requested-or-returned event mask (`POLLIN`/
/// `POLLOUT`/`POLLPRI`-shaped, spec.md §3's poll-request triples).
macro_rules! bitflags_lite {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const fn empty() -> Self { $name(0) }
            pub fn is_empty(self) -> bool { self.0 == 0 }
            pub fn contains(self, other: $name) -> bool { (self.0 & other.0) == other.0 }
            pub fn insert(&mut self, other: $name) { self.0 |= other.0; }
            pub fn remove(&mut self, other: $name) { self.0 &= !other.0; }
        }
        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name { $name(self.0 | rhs.0) }
        }
        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) { self.0 |= rhs.0; }
        }
    };
}

bitflags_lite! {
    pub struct PollEvents: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXCEPT = 1 << 2;
        /// Set on `revents` only, never requested: the descriptor was found
        /// invalid (closed out from under a waiter) by the select backend's
        /// `EBADF` probe (spec.md §8's "invalid-descriptor bit").
        const INVALID = 1 << 3;
    }
}

/// One `{fd, events_wanted, events_returned}` triple, spec.md §3.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: RawFd, events: PollEvents) -> Self {
        PollFd { fd, events, revents: PollEvents::empty() }
    }
}

/// A coroutine's short-lived interest in a set of descriptor events
/// (spec.md §3's "Poll request"). Heap-allocated and linked onto the VP's
/// I/O queue via its own `link`, distinct from the waiting coroutine's own
/// queue link (which stays unused while the coroutine is `IoWait`).
pub struct PollRequest {
    pub link: Link,
    pub co: CoroutineRef,
    pub fds: Vec<PollFd>,
    pub on_ioq: bool,
}

impl PollRequest {
    pub fn new(co: CoroutineRef, fds: Vec<PollFd>) -> Box<PollRequest> {
        Box::new(PollRequest { link: Link::new(), co, fds, on_ioq: false })
    }

    /// How many of this request's descriptors currently have nonzero
    /// `revents` (spec.md §4.8's `poll` return value).
    pub fn ready_count(&self) -> usize {
        self.fds.iter().filter(|pd| !pd.revents.is_empty()).count()
    }
}

/// The VP's I/O queue: every [`PollRequest`] currently awaiting readiness,
/// FIFO by registration order. A thin intrusive-list wrapper so backends
/// can walk it without the VP exposing its run queue's own `Link` type.
pub struct IoQueue {
    head: Link,
}

impl IoQueue {
    /// Not yet self-linked: the VP constructs one of these as a plain
    /// field during its own (movable) construction, then calls [`init`]
    /// once it has settled at its final thread-local address, exactly
    /// like `vp::st_init`'s treatment of the run and zombie queues.
    ///
    /// [`init`]: IoQueue::init
    pub fn new() -> Self {
        IoQueue { head: Link::new() }
    }

    /// # Safety
    /// `self` must be at the stable address it will occupy for the rest of
    /// its life (thread-local storage).
    pub unsafe fn init(&mut self) {
        let ptr = unsafe { NonNull::new_unchecked(&mut self.head as *mut Link) };
        unsafe { Link::init(ptr) };
    }

    fn head_ptr(&mut self) -> NonNull<Link> {
        unsafe { NonNull::new_unchecked(&mut self.head as *mut Link) }
    }

    pub fn push_back(&mut self, req: NonNull<PollRequest>) {
        unsafe {
            Link::insert_before(link_of(req), self.head_ptr());
            (*req.as_ptr()).on_ioq = true;
        }
    }

    pub fn remove(&mut self, req: NonNull<PollRequest>) {
        unsafe {
            if (*req.as_ptr()).on_ioq {
                Link::remove(link_of(req));
                (*req.as_ptr()).on_ioq = false;
            }
        }
    }

    /// Every request currently linked, for a backend's readiness-matching
    /// pass. Collected into a `Vec` rather than a lazy iterator since
    /// backends mutate `revents`/unlink entries while walking.
    pub fn snapshot(&mut self) -> Vec<NonNull<PollRequest>> {
        let head = self.head_ptr();
        let mut out = Vec::new();
        let mut cur = unsafe { (*head.as_ptr()).next.unwrap() };
        while cur != head {
            out.push(cur.cast());
            cur = unsafe { (*cur.as_ptr()).next.unwrap() };
        }
        out
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn link_of(req: NonNull<PollRequest>) -> NonNull<Link> {
    unsafe { NonNull::new_unchecked(&mut (*req.as_ptr()).link as *mut Link) }
}

/// `st_set_eventsys`'s selector (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSysSelector {
    /// Platform's best native backend: edge-polling (epoll) on Linux,
    /// level-polling (kqueue) on BSD/Darwin, `select` everywhere else.
    #[default]
    Default,
    /// Force the `select`-based backend regardless of platform.
    Select,
    /// Force the platform's alternative native backend explicitly (same
    /// resolution as `Default` today, kept distinct per spec.md §6 since a
    /// future platform may have more than one native alternative).
    Alternative,
}

/// The event-system vtable (spec.md §4.5). A coroutine's single poll
/// request may span several descriptors; a backend's `dispatch` is
/// responsible for walking `io_q`, filling in `revents`, unlinking
/// satisfied requests, and reporting which coroutines are now runnable —
/// `vp.rs` moves them onto the run queue.
pub trait EventBackend {
    fn name(&self) -> &'static str;

    /// Register `req`'s descriptors. On partial failure, every
    /// already-registered descriptor in `req` is unregistered again before
    /// returning the error (spec.md §7's "never leave an inconsistent
    /// pollset on failure").
    fn pollset_add(&mut self, req: NonNull<PollRequest>) -> StResult<()>;

    /// Undo a prior `pollset_add`. No-op (not an error) if some or all
    /// descriptors were never registered.
    fn pollset_del(&mut self, req: NonNull<PollRequest>);

    /// Block for up to `timeout_us` microseconds (`None` = forever) for
    /// readiness, then drain `io_q` of every request that became ready,
    /// returning the coroutines to wake.
    fn dispatch(&mut self, io_q: &mut IoQueue, timeout_us: Option<u64>) -> Vec<CoroutineRef>;

    /// Called when a descriptor is first wrapped by the façade.
    fn fd_new(&mut self, fd: RawFd);

    /// Called before a descriptor is closed.
    ///
    /// # Errors
    /// [`StError::Busy`] if the descriptor still has outstanding interest
    /// from a live poll request.
    fn fd_close(&mut self, fd: RawFd) -> StResult<()>;

    /// The backend's own ceiling on live descriptors (`FD_SETSIZE` for
    /// `select`; the process's soft `RLIMIT_NOFILE` otherwise).
    fn fd_getlimit(&self) -> usize;
}

pub fn build_backend(sel: EventSysSelector) -> Box<dyn EventBackend> {
    match sel {
        EventSysSelector::Select => Box::new(select_backend::SelectBackend::new()),
        EventSysSelector::Default | EventSysSelector::Alternative => native_backend(),
    }
}

#[cfg(target_os = "linux")]
fn native_backend() -> Box<dyn EventBackend> {
    match epoll_backend::EpollBackend::new() {
        Some(b) => Box::new(b),
        None => Box::new(select_backend::SelectBackend::new()),
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
fn native_backend() -> Box<dyn EventBackend> {
    match kqueue_backend::KqueueBackend::new() {
        Some(b) => Box::new(b),
        None => Box::new(select_backend::SelectBackend::new()),
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn native_backend() -> Box<dyn EventBackend> {
    Box::new(select_backend::SelectBackend::new())
}

/// Convert a dispatch timeout (microseconds until the earliest sleeper, or
/// `None` for "no sleeper pending, block indefinitely") to milliseconds
/// with spec.md §4.5's sub-millisecond-rounds-up-to-1ms rule, for the two
/// millisecond-granularity backends (epoll, select-via-`pselect`-less
/// `select`'s `struct timeval` which we keep in microseconds instead — see
/// `select_backend`).
fn timeout_to_millis(timeout_us: Option<u64>) -> i32 {
    match timeout_us {
        None => -1,
        Some(0) => 0,
        Some(us) => {
            let ms = us.div_ceil(1000);
            ms.min(i32::MAX as u64) as i32
        }
    }
}

#[cfg(target_os = "linux")]
mod epoll_backend {
    use super::*;
    use std::os::fd::FromRawFd;

    #[derive(Default, Clone, Copy)]
    struct FdCounts {
        rd: u32,
        wr: u32,
        ex: u32,
        revents: i16,
    }

    /// Edge-polling backend (spec.md §4.5's "Edge-polling backend").
    pub struct EpollBackend {
        epfd: std::os::fd::OwnedFd,
        fd_data: Vec<FdCounts>,
        evtlist: Vec<libc::epoll_event>,
    }

    impl EpollBackend {
        pub fn new() -> Option<Self> {
            // SAFETY: epoll_create1 has no preconditions.
            let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if raw < 0 {
                return None;
            }
            let epfd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };
            Some(EpollBackend { epfd, fd_data: Vec::new(), evtlist: vec![unsafe { std::mem::zeroed() }; 256] })
        }

        fn ensure(&mut self, fd: RawFd) -> &mut FdCounts {
            let idx = fd as usize;
            if idx >= self.fd_data.len() {
                self.fd_data.resize(idx + 1, FdCounts::default());
            }
            &mut self.fd_data[idx]
        }

        fn interest_mask(c: &FdCounts) -> u32 {
            let mut m = 0u32;
            if c.rd > 0 {
                m |= libc::EPOLLIN as u32;
            }
            if c.wr > 0 {
                m |= libc::EPOLLOUT as u32;
            }
            if c.ex > 0 {
                m |= libc::EPOLLPRI as u32;
            }
            m
        }

        fn sync_kernel(&mut self, fd: RawFd) {
            use std::os::fd::AsRawFd;
            let c = self.fd_data[fd as usize];
            let mask = Self::interest_mask(&c);
            let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
            ev.events = mask;
            ev.u64 = fd as u64;
            // A nonzero `revents` means the kernel already reported this fd
            // ready this cycle; deferring the ctl call here (rather than
            // applying it immediately) avoids the kernel forgetting
            // readiness the caller hasn't consumed yet (spec.md §4.5).
            if c.revents != 0 && mask != 0 {
                return;
            }
            if mask == 0 {
                // SAFETY: epoll_ctl with DEL ignores `ev`.
                unsafe {
                    libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            } else {
                // Try MOD first (the common case: interest changed on an
                // fd we've already registered); ADD only if that fails
                // because this is the fd's first nonzero interest.
                // SAFETY: `ev` is a valid, fully initialized epoll_event.
                unsafe {
                    if libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev) < 0
                        && std::io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT)
                    {
                        libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev);
                    }
                }
            }
        }
    }

    impl EventBackend for EpollBackend {
        fn name(&self) -> &'static str {
            "epoll"
        }

        fn pollset_add(&mut self, req: NonNull<PollRequest>) -> StResult<()> {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                let c = self.ensure(pd.fd);
                if pd.events.contains(PollEvents::READ) {
                    c.rd += 1;
                }
                if pd.events.contains(PollEvents::WRITE) {
                    c.wr += 1;
                }
                if pd.events.contains(PollEvents::EXCEPT) {
                    c.ex += 1;
                }
                self.sync_kernel(pd.fd);
            }
            Ok(())
        }

        fn pollset_del(&mut self, req: NonNull<PollRequest>) {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                if (pd.fd as usize) >= self.fd_data.len() {
                    continue;
                }
                let c = &mut self.fd_data[pd.fd as usize];
                if pd.events.contains(PollEvents::READ) {
                    c.rd = c.rd.saturating_sub(1);
                }
                if pd.events.contains(PollEvents::WRITE) {
                    c.wr = c.wr.saturating_sub(1);
                }
                if pd.events.contains(PollEvents::EXCEPT) {
                    c.ex = c.ex.saturating_sub(1);
                }
                self.sync_kernel(pd.fd);
            }
        }

        fn dispatch(&mut self, io_q: &mut IoQueue, timeout_us: Option<u64>) -> Vec<CoroutineRef> {
            use std::os::fd::AsRawFd;
            let timeout_ms = timeout_to_millis(timeout_us);
            // SAFETY: `evtlist` is a valid, writable buffer of the given
            // capacity.
            let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), self.evtlist.as_mut_ptr(), self.evtlist.len() as i32, timeout_ms) };
            if n <= 0 {
                return Vec::new();
            }
            for i in 0..n as usize {
                let ev = self.evtlist[i];
                let fd = ev.u64 as RawFd;
                if (fd as usize) < self.fd_data.len() {
                    self.fd_data[fd as usize].revents = ev.events as i16;
                }
            }

            let mut woken = Vec::new();
            for req in io_q.snapshot() {
                let mut any = false;
                unsafe {
                    for pd in &mut (*req.as_ptr()).fds {
                        if (pd.fd as usize) >= self.fd_data.len() {
                            continue;
                        }
                        let revents = self.fd_data[pd.fd as usize].revents;
                        let mut got = PollEvents::empty();
                        if revents & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as i16 != 0 && pd.events.contains(PollEvents::READ) {
                            got.insert(PollEvents::READ);
                        }
                        if revents & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as i16 != 0 && pd.events.contains(PollEvents::WRITE) {
                            got.insert(PollEvents::WRITE);
                        }
                        if revents & libc::EPOLLPRI as i16 != 0 && pd.events.contains(PollEvents::EXCEPT) {
                            got.insert(PollEvents::EXCEPT);
                        }
                        if !got.is_empty() {
                            pd.revents |= got;
                            any = true;
                        }
                    }
                }
                if any {
                    self.pollset_del(req);
                    io_q.remove(req);
                    unsafe {
                        (*req.as_ptr()).on_ioq = false;
                        woken.push((*req.as_ptr()).co);
                    }
                }
            }

            for i in 0..n as usize {
                let fd = self.evtlist[i].u64 as RawFd;
                if (fd as usize) < self.fd_data.len() {
                    self.fd_data[fd as usize].revents = 0;
                    self.sync_kernel(fd);
                }
            }
            woken
        }

        fn fd_new(&mut self, fd: RawFd) {
            self.ensure(fd);
        }

        fn fd_close(&mut self, fd: RawFd) -> StResult<()> {
            if let Some(c) = self.fd_data.get(fd as usize) {
                if c.rd > 0 || c.wr > 0 || c.ex > 0 {
                    return Err(StError::Busy);
                }
            }
            Ok(())
        }

        fn fd_getlimit(&self) -> usize {
            soft_fd_limit()
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
mod kqueue_backend {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    #[derive(Default, Clone, Copy)]
    struct FdCounts {
        rd: u32,
        wr: u32,
    }

    /// Level-polling (kqueue-style) backend (spec.md §4.5). One-shot arms:
    /// each registered filter is re-armed every dispatch for every request
    /// still outstanding, since `EV_ONESHOT` auto-clears on fire.
    pub struct KqueueBackend {
        kq: OwnedFd,
        fd_data: Vec<FdCounts>,
        changes: Vec<libc::kevent>,
        evtlist: Vec<libc::kevent>,
    }

    impl KqueueBackend {
        pub fn new() -> Option<Self> {
            let raw = unsafe { libc::kqueue() };
            if raw < 0 {
                return None;
            }
            let kq = unsafe { OwnedFd::from_raw_fd(raw) };
            Some(KqueueBackend { kq, fd_data: Vec::new(), changes: Vec::new(), evtlist: vec![unsafe { std::mem::zeroed() }; 256] })
        }

        fn ensure(&mut self, fd: RawFd) -> &mut FdCounts {
            let idx = fd as usize;
            if idx >= self.fd_data.len() {
                self.fd_data.resize(idx + 1, FdCounts::default());
            }
            &mut self.fd_data[idx]
        }

        fn push_change(&mut self, fd: RawFd, filter: i16, flags: u16) {
            let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
            kev.ident = fd as usize;
            kev.filter = filter;
            kev.flags = flags;
            self.changes.push(kev);
        }
    }

    impl EventBackend for KqueueBackend {
        fn name(&self) -> &'static str {
            "kqueue"
        }

        fn pollset_add(&mut self, req: NonNull<PollRequest>) -> StResult<()> {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                if pd.events.contains(PollEvents::READ) {
                    self.ensure(pd.fd).rd += 1;
                    self.push_change(pd.fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ONESHOT);
                }
                if pd.events.contains(PollEvents::WRITE) {
                    self.ensure(pd.fd).wr += 1;
                    self.push_change(pd.fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ONESHOT);
                }
            }
            Ok(())
        }

        fn pollset_del(&mut self, req: NonNull<PollRequest>) {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                if (pd.fd as usize) >= self.fd_data.len() {
                    continue;
                }
                let c = &mut self.fd_data[pd.fd as usize];
                if pd.events.contains(PollEvents::READ) {
                    c.rd = c.rd.saturating_sub(1);
                    if c.rd == 0 {
                        self.push_change(pd.fd, libc::EVFILT_READ, libc::EV_DELETE);
                    }
                }
                if pd.events.contains(PollEvents::WRITE) {
                    c.wr = c.wr.saturating_sub(1);
                    if c.wr == 0 {
                        self.push_change(pd.fd, libc::EVFILT_WRITE, libc::EV_DELETE);
                    }
                }
            }
        }

        fn dispatch(&mut self, io_q: &mut IoQueue, timeout_us: Option<u64>) -> Vec<CoroutineRef> {
            let ts = timeout_us.map(|us| libc::timespec { tv_sec: (us / 1_000_000) as libc::time_t, tv_nsec: ((us % 1_000_000) * 1000) as libc::c_long });
            let ts_ptr = ts.as_ref().map(|t| t as *const libc::timespec).unwrap_or(std::ptr::null());

            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    self.changes.as_ptr(),
                    self.changes.len() as i32,
                    self.evtlist.as_mut_ptr(),
                    self.evtlist.len() as i32,
                    ts_ptr,
                )
            };
            self.changes.clear();
            if n <= 0 {
                return Vec::new();
            }

            let mut ready_read = std::collections::HashSet::new();
            let mut ready_write = std::collections::HashSet::new();
            for i in 0..n as usize {
                let kev = self.evtlist[i];
                let fd = kev.ident as RawFd;
                match kev.filter {
                    libc::EVFILT_READ => {
                        ready_read.insert(fd);
                    }
                    libc::EVFILT_WRITE => {
                        ready_write.insert(fd);
                    }
                    _ => {}
                }
            }

            let mut woken = Vec::new();
            for req in io_q.snapshot() {
                let mut any = false;
                unsafe {
                    for pd in &mut (*req.as_ptr()).fds {
                        if pd.events.contains(PollEvents::READ) && ready_read.contains(&pd.fd) {
                            pd.revents.insert(PollEvents::READ);
                            any = true;
                        }
                        if pd.events.contains(PollEvents::WRITE) && ready_write.contains(&pd.fd) {
                            pd.revents.insert(PollEvents::WRITE);
                            any = true;
                        }
                    }
                }
                if any {
                    self.pollset_del(req);
                    io_q.remove(req);
                    unsafe {
                        (*req.as_ptr()).on_ioq = false;
                        woken.push((*req.as_ptr()).co);
                    }
                }
            }
            woken
        }

        fn fd_new(&mut self, fd: RawFd) {
            self.ensure(fd);
        }

        fn fd_close(&mut self, fd: RawFd) -> StResult<()> {
            if let Some(c) = self.fd_data.get(fd as usize) {
                if c.rd > 0 || c.wr > 0 {
                    return Err(StError::Busy);
                }
            }
            Ok(())
        }

        fn fd_getlimit(&self) -> usize {
            soft_fd_limit()
        }
    }
}

mod select_backend {
    use super::*;
    use std::collections::HashMap;

    /// `FD_SETSIZE`-bounded bitset built on the portable "array of
    /// machine words" layout every libc's `fd_set` actually uses, avoiding
    /// a dependency on `libc::fd_set`'s private field names (which aren't
    /// exposed uniformly across platforms).
    #[derive(Clone)]
    struct FdSet {
        words: Vec<usize>,
    }

    const WORD_BITS: usize = usize::BITS as usize;

    impl FdSet {
        fn new() -> Self {
            FdSet { words: vec![0; libc::FD_SETSIZE / WORD_BITS] }
        }
        fn clear(&mut self) {
            self.words.iter_mut().for_each(|w| *w = 0);
        }
        fn set(&mut self, fd: RawFd) {
            let fd = fd as usize;
            self.words[fd / WORD_BITS] |= 1 << (fd % WORD_BITS);
        }
        fn is_set(&self, fd: RawFd) -> bool {
            let fd = fd as usize;
            self.words[fd / WORD_BITS] & (1 << (fd % WORD_BITS)) != 0
        }
        fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
            self.words.as_mut_ptr().cast()
        }
    }

    #[derive(Default, Clone, Copy)]
    struct FdCounts {
        rd: u32,
        wr: u32,
        ex: u32,
    }

    /// `select`-based backend (spec.md §4.5), the last-resort fallback.
    pub struct SelectBackend {
        fd_data: HashMap<RawFd, FdCounts>,
        max_fd: RawFd,
    }

    impl SelectBackend {
        pub fn new() -> Self {
            SelectBackend { fd_data: HashMap::new(), max_fd: -1 }
        }

        fn recompute_max(&mut self) {
            self.max_fd = self.fd_data.iter().filter(|(_, c)| c.rd > 0 || c.wr > 0 || c.ex > 0).map(|(fd, _)| *fd).max().unwrap_or(-1);
        }
    }

    impl Default for SelectBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventBackend for SelectBackend {
        fn name(&self) -> &'static str {
            "select"
        }

        fn pollset_add(&mut self, req: NonNull<PollRequest>) -> StResult<()> {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                if pd.fd as usize >= libc::FD_SETSIZE {
                    return Err(StError::FdLimit);
                }
                let c = self.fd_data.entry(pd.fd).or_default();
                if pd.events.contains(PollEvents::READ) {
                    c.rd += 1;
                }
                if pd.events.contains(PollEvents::WRITE) {
                    c.wr += 1;
                }
                if pd.events.contains(PollEvents::EXCEPT) {
                    c.ex += 1;
                }
            }
            self.recompute_max();
            Ok(())
        }

        fn pollset_del(&mut self, req: NonNull<PollRequest>) {
            for pd in unsafe { &(*req.as_ptr()).fds } {
                if let Some(c) = self.fd_data.get_mut(&pd.fd) {
                    if pd.events.contains(PollEvents::READ) {
                        c.rd = c.rd.saturating_sub(1);
                    }
                    if pd.events.contains(PollEvents::WRITE) {
                        c.wr = c.wr.saturating_sub(1);
                    }
                    if pd.events.contains(PollEvents::EXCEPT) {
                        c.ex = c.ex.saturating_sub(1);
                    }
                }
            }
            self.fd_data.retain(|_, c| c.rd > 0 || c.wr > 0 || c.ex > 0);
            self.recompute_max();
        }

        fn dispatch(&mut self, io_q: &mut IoQueue, timeout_us: Option<u64>) -> Vec<CoroutineRef> {
            let mut rset = FdSet::new();
            let mut wset = FdSet::new();
            let mut eset = FdSet::new();
            for (&fd, c) in &self.fd_data {
                if c.rd > 0 {
                    rset.set(fd);
                }
                if c.wr > 0 {
                    wset.set(fd);
                }
                if c.ex > 0 {
                    eset.set(fd);
                }
            }

            let mut tv = timeout_us.map(|us| libc::timeval { tv_sec: (us / 1_000_000) as libc::time_t, tv_usec: (us % 1_000_000) as libc::suseconds_t });
            let tv_ptr = tv.as_mut().map(|t| t as *mut libc::timeval).unwrap_or(std::ptr::null_mut());

            let n = unsafe { libc::select(self.max_fd + 1, rset.as_mut_ptr(), wset.as_mut_ptr(), eset.as_mut_ptr(), tv_ptr) };

            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EBADF) {
                    return self.find_bad_fd_and_wake(io_q);
                }
                return Vec::new();
            }
            if n == 0 {
                return Vec::new();
            }

            let mut woken = Vec::new();
            for req in io_q.snapshot() {
                let mut any = false;
                unsafe {
                    for pd in &mut (*req.as_ptr()).fds {
                        if pd.events.contains(PollEvents::READ) && rset.is_set(pd.fd) {
                            pd.revents.insert(PollEvents::READ);
                            any = true;
                        }
                        if pd.events.contains(PollEvents::WRITE) && wset.is_set(pd.fd) {
                            pd.revents.insert(PollEvents::WRITE);
                            any = true;
                        }
                        if pd.events.contains(PollEvents::EXCEPT) && eset.is_set(pd.fd) {
                            pd.revents.insert(PollEvents::EXCEPT);
                            any = true;
                        }
                    }
                }
                if any {
                    self.pollset_del(req);
                    io_q.remove(req);
                    unsafe {
                        (*req.as_ptr()).on_ioq = false;
                        woken.push((*req.as_ptr()).co);
                    }
                }
            }
            woken
        }

        fn fd_new(&mut self, _fd: RawFd) {}

        fn fd_close(&mut self, fd: RawFd) -> StResult<()> {
            if let Some(c) = self.fd_data.get(&fd) {
                if c.rd > 0 || c.wr > 0 || c.ex > 0 {
                    return Err(StError::Busy);
                }
            }
            Ok(())
        }

        fn fd_getlimit(&self) -> usize {
            libc::FD_SETSIZE
        }
    }

    impl SelectBackend {
        /// `select` returned `EBADF` without saying which descriptor: probe
        /// each pending request's descriptors individually with `fcntl`'s
        /// `F_GETFD` and mark the offending one invalid on its request
        /// (spec.md §4.5/§8's "descriptor closed while another coroutine
        /// polls on it" boundary behavior).
        fn find_bad_fd_and_wake(&mut self, io_q: &mut IoQueue) -> Vec<CoroutineRef> {
            let mut woken = Vec::new();
            for req in io_q.snapshot() {
                let mut bad = false;
                unsafe {
                    for pd in &mut (*req.as_ptr()).fds {
                        if libc::fcntl(pd.fd, libc::F_GETFD) < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EBADF) {
                            pd.revents.insert(PollEvents::INVALID);
                            bad = true;
                        }
                    }
                }
                if bad {
                    self.pollset_del(req);
                    io_q.remove(req);
                    unsafe {
                        (*req.as_ptr()).on_ioq = false;
                        woken.push((*req.as_ptr()).co);
                    }
                }
            }
            woken
        }
    }
}

fn soft_fd_limit() -> usize {
    let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `lim` is a valid, writable `rlimit`.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0 {
        lim.rlim_cur as usize
    } else {
        1024
    }
}

/// Raise the process's soft `RLIMIT_NOFILE` to its hard limit
/// (`st_init`'s "raise the descriptor limit" step, spec.md §4.6).
pub fn raise_fd_limit() {
    let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `lim` is a valid, writable `rlimit`.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) == 0 && lim.rlim_cur < lim.rlim_max {
            lim.rlim_cur = lim.rlim_max;
            libc::setrlimit(libc::RLIMIT_NOFILE, &lim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_to_millis_rounds_sub_millisecond_up() {
        assert_eq!(timeout_to_millis(None), -1);
        assert_eq!(timeout_to_millis(Some(0)), 0);
        assert_eq!(timeout_to_millis(Some(1)), 1);
        assert_eq!(timeout_to_millis(Some(999)), 1);
        assert_eq!(timeout_to_millis(Some(1000)), 1);
        assert_eq!(timeout_to_millis(Some(1001)), 2);
    }

    #[test]
    fn poll_fd_starts_with_empty_revents() {
        let pd = PollFd::new(3, PollEvents::READ);
        assert!(pd.revents.is_empty());
        assert!(pd.events.contains(PollEvents::READ));
    }
}
