// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! A cooperative user-space coroutine scheduler: one OS thread hosts many
//! "state threads," each a stackful coroutine that yields control at
//! well-defined suspension points (I/O wait, sleep, mutex/condvar wait,
//! explicit yield) rather than being preemptively timesliced.
//!
//! Grounded on [st-srs](https://github.com/ossrs/state-threads), a C
//! library of the same name and design; this crate reimplements its
//! scheduler, timeout heap, pluggable I/O-readiness backends, descriptor
//! façade, and sync primitives idiomatically rather than porting its C
//! line-for-line. See the individual modules for the original function(s)
//! each part is grounded on.
//!
//! # Example
//!
//! ```no_run
//! use state_threads::{init, thread_create, thread_join};
//!
//! init().unwrap();
//! let t = thread_create(0, true, Some("worker".into()), || {
//!     42i32
//! }).unwrap();
//! let retval = thread_join(t).unwrap();
//! assert_eq!(*retval.downcast::<i32>().unwrap(), 42);
//! ```

mod clist;
mod context;
mod coroutine;
mod error;
mod event;
mod heap;
mod key;
mod netfd;
mod stack;
mod sync;
mod time;
mod vp;

use std::any::Any;
use std::time::Duration;

pub use coroutine::CoroutineRef as ThreadRef;
pub use error::{StError, StResult};
pub use event::{EventSysSelector, PollEvents, PollFd};
pub use key::Destructor as KeyDestructor;
pub use key::Key;
pub use netfd::{FdDestructor, NetFd};
pub use sync::{CondVar, Mutex};

/// One-time per-OS-thread initialization (`st_init`). Idempotent.
///
/// Also installs a process-wide ignore for `SIGPIPE`: every descriptor
/// operation in this crate already turns a broken pipe into an
/// [`StError::Io`] via the write-family's normal error path, so the
/// default "terminate the process" disposition would only ever fire
/// before a caller gets the chance to see that error (`_st_io_init`).
pub fn init() -> StResult<()> {
    install_sigpipe_ignore();
    vp::st_init()
}

fn install_sigpipe_ignore() {
    // SAFETY: installing `SIG_IGN` for `SIGPIPE` has no preconditions and
    // is idempotent; racing with another thread doing the same is benign
    // (both write the same disposition).
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Sentinel `timeout` meaning "wait forever" for every API in this crate
/// that takes an `Option<Duration>` timeout (spec.md §6). Kept only for
/// callers translating from a raw-integer C-shaped API; idiomatic callers
/// should just pass `None`.
pub const NO_TIMEOUT: Option<Duration> = None;

/// Sentinel `timeout` meaning "don't wait at all, just poll once."
pub const NO_WAIT: Duration = Duration::ZERO;

// ------------------------------------------------------------ Process config

/// Select which I/O-readiness backend the VP on this OS thread uses
/// (`st_set_eventsys`). Must be called before the first suspension on this
/// thread.
pub fn set_eventsys(sel: EventSysSelector) -> StResult<()> {
    vp::set_eventsys(sel)
}

/// Enable or disable randomizing each new coroutine's stack base address
/// (`st_randomize_stacks`), a defense against stack-address-dependent
/// exploits. Disabled by default.
pub fn randomize_stacks(enabled: bool) {
    vp::randomize_stacks(enabled);
}

/// Install a callback run just after a coroutine is resumed.
pub fn set_switch_in_cb(cb: Option<Box<dyn Fn(ThreadRef)>>) {
    vp::set_switch_in_cb(cb);
}

/// Install a callback run just before a coroutine is suspended.
pub fn set_switch_out_cb(cb: Option<Box<dyn Fn(ThreadRef)>>) {
    vp::set_switch_out_cb(cb);
}

/// Override the process's time source (`st_set_utime_function`); see
/// [`crate::time`]'s module docs (spec.md §10's supplemented feature).
pub fn set_utime_function(f: Option<fn() -> u64>) {
    time::set_utime_function(f);
}

/// Enable or disable the second-resolution wall-clock cache
/// (`st_timecache_set`).
pub fn timecache_set(enabled: bool) {
    time::timecache_set(enabled);
}

/// The cached wall-clock second count (`st_time`).
pub fn time_seconds() -> u64 {
    time::time_seconds()
}

/// The VP's last-sampled monotonic clock, in microseconds
/// (`st_utime_last_clock`, spec.md §10's supplemented feature).
pub fn utime_last_clock() -> u64 {
    vp::last_clock()
}

#[cfg(feature = "stats")]
pub use vp::VpStats;

/// A snapshot of this OS thread's debug counters (spec.md §10's `stats`
/// feature; only present when the crate is built with `--features stats`).
#[cfg(feature = "stats")]
pub fn stats_snapshot() -> VpStats {
    vp::stats_snapshot()
}

// ----------------------------------------------------------------- Threads

/// Spawn a new coroutine (`st_thread_create`). `stack_size` of `0` uses the
/// crate default; `joinable` controls whether [`thread_join`] may later
/// collect its return value.
pub fn thread_create<F, T>(stack_size: usize, joinable: bool, name: Option<String>, f: F) -> StResult<ThreadRef>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    vp::thread_create(stack_size, joinable, name, f)
}

/// The currently running coroutine (`st_thread_self`).
pub fn thread_self() -> ThreadRef {
    vp::current()
}

/// Give up the rest of the current quantum (`st_thread_yield`).
pub fn thread_yield() {
    vp::thread_yield();
}

/// Suspend the current coroutine for `timeout` (`None` = forever)
/// (`st_sleep`/`st_usleep`).
///
/// # Errors
/// [`StError::Interrupted`] if interrupted before `timeout` elapses.
pub fn sleep(timeout: Option<Duration>) -> StResult<()> {
    vp::sleep(timeout)
}

/// Request that `target` wake up at its next suspension point, or
/// immediately if already suspended (`st_thread_interrupt`).
pub fn thread_interrupt(target: ThreadRef) {
    vp::thread_interrupt(target);
}

/// Terminate the calling coroutine early (`st_thread_exit`). Never
/// returns.
pub fn thread_exit(retval: Box<dyn Any>) -> ! {
    vp::thread_exit(retval)
}

/// Block until `target` (created joinable) exits, then return its boxed
/// return value (`st_thread_join`).
///
/// # Errors
/// [`StError::Deadlock`] if `target` is the calling coroutine.
/// [`StError::InvalidArgument`] if `target` wasn't created joinable, or
/// another coroutine is already joining it.
pub fn thread_join(target: ThreadRef) -> StResult<Box<dyn Any>> {
    vp::thread_join(target)
}

// -------------------------------------------------------- Sync primitives

/// Allocate a new mutex (`st_mutex_new`).
pub fn mutex_new() -> Box<Mutex> {
    Mutex::new()
}

/// Allocate a new condition variable (`st_cond_new`).
pub fn cond_new() -> Box<CondVar> {
    CondVar::new()
}

// ---------------------------------------------------------------- Keyed storage

/// Allocate a new per-coroutine storage key (`st_key_create`).
///
/// # Errors
/// [`StError::TooManyKeys`] once [`key_getlimit`] keys already exist.
pub fn key_create(destructor: Option<KeyDestructor>) -> StResult<Key> {
    key::key_create(destructor)
}

/// The fixed maximum number of per-coroutine storage keys a process may
/// ever create (`st_key_getlimit`); always 16.
pub fn key_getlimit() -> usize {
    key::key_getlimit()
}

/// Store `value` in the current coroutine's slot for `key`, dropping (via
/// its destructor, if any) whatever was there before
/// (`st_thread_setspecific`).
pub fn thread_setspecific(key: Key, value: Box<dyn Any>) {
    let me = thread_self();
    let idx = key::index_of(key);
    // SAFETY: `me` is the currently running coroutine; no one else can be
    // touching its keyed-storage slots concurrently under cooperative
    // scheduling.
    unsafe { (*me.as_ptr()).keys[idx].value = Some(value) };
}

/// Borrow the current coroutine's value for `key`, if any
/// (`st_thread_getspecific`).
pub fn thread_getspecific(key: Key) -> Option<&'static dyn Any> {
    let me = thread_self();
    let idx = key::index_of(key);
    // SAFETY: same reasoning as `thread_setspecific`; the returned
    // reference is only ever read back by the same coroutine before it
    // next mutates or exits, both of which happen on this same OS thread.
    unsafe { (*me.as_ptr()).keys[idx].value.as_deref() }
}

// -------------------------------------------------------------- Descriptors

/// Wrap an already-open descriptor (`st_netfd_open`).
pub fn netfd_open(fd: std::os::unix::io::RawFd) -> StResult<NetFd> {
    NetFd::open(fd)
}

/// Wrap an already-open socket (`st_netfd_open_socket`).
pub fn netfd_open_socket(fd: std::os::unix::io::RawFd) -> StResult<NetFd> {
    NetFd::open_socket(fd)
}

/// Close `fd` and release its resources (`st_netfd_close`).
pub fn netfd_close(fd: NetFd) -> StResult<()> {
    fd.close()
}

/// The raw OS descriptor underlying `fd` (`st_netfd_fileno`).
pub fn netfd_fileno(fd: &NetFd) -> std::os::unix::io::RawFd {
    fd.fileno()
}

/// Wait for `events` readiness on a single descriptor (`st_netfd_poll`).
pub fn netfd_poll(fd: &NetFd, events: PollEvents, timeout: Option<Duration>) -> StResult<()> {
    fd.netfd_poll(events, timeout)
}

/// Wait for readiness across many descriptors at once (`st_poll`). See
/// [`netfd::poll`]'s docs for the exact wake conditions.
pub fn poll(pds: &mut [PollFd], timeout: Option<Duration>) -> StResult<usize> {
    netfd::poll(pds, timeout)
}

/// Non-blocking `read(2)`, one attempt (`st_read`).
pub fn read(fd: &NetFd, buf: &mut [u8], timeout: Option<Duration>) -> StResult<usize> {
    netfd::read(fd, buf, timeout)
}

/// Reads until `buf` is completely filled, EOF, or an error (`st_read_fully`,
/// spec.md §10's supplemented residual read).
pub fn read_fully(fd: &NetFd, buf: &mut [u8], timeout: Option<Duration>) -> StResult<usize> {
    netfd::read_fully(fd, buf, timeout)
}

/// Non-blocking vectored `readv(2)`, one attempt (`st_readv`).
pub fn readv(fd: &NetFd, iov: &mut [std::io::IoSliceMut<'_>], timeout: Option<Duration>) -> StResult<usize> {
    netfd::readv(fd, iov, timeout)
}

/// Writes every byte of `buf` or fails (`st_write`).
pub fn write(fd: &NetFd, buf: &[u8], timeout: Option<Duration>) -> StResult<usize> {
    netfd::write(fd, buf, timeout)
}

/// Vectored counterpart of [`write`] (`st_writev`).
pub fn writev(fd: &NetFd, iov: &[std::io::IoSlice<'_>], timeout: Option<Duration>) -> StResult<usize> {
    netfd::writev(fd, iov, timeout)
}

/// Non-blocking `accept(2)` (`st_accept`).
pub fn accept(fd: &NetFd, addr: Option<&mut libc::sockaddr_storage>, timeout: Option<Duration>) -> StResult<NetFd> {
    netfd::accept(fd, addr, timeout)
}

/// Non-blocking `connect(2)` (`st_connect`).
pub fn connect(fd: &NetFd, addr: &libc::sockaddr, addrlen: libc::socklen_t, timeout: Option<Duration>) -> StResult<()> {
    netfd::connect(fd, addr, addrlen, timeout)
}

/// Non-blocking `recvfrom(2)` (`st_recvfrom`).
pub fn recvfrom(fd: &NetFd, buf: &mut [u8], from: Option<&mut libc::sockaddr_storage>, timeout: Option<Duration>) -> StResult<usize> {
    netfd::recvfrom(fd, buf, from, timeout)
}

/// Non-blocking `sendto(2)` (`st_sendto`).
pub fn sendto(fd: &NetFd, buf: &[u8], to: &libc::sockaddr, tolen: libc::socklen_t, timeout: Option<Duration>) -> StResult<usize> {
    netfd::sendto(fd, buf, to, tolen, timeout)
}

/// Non-blocking `recvmsg(2)` (`st_recvmsg`).
pub fn recvmsg(fd: &NetFd, msg: &mut libc::msghdr, flags: i32, timeout: Option<Duration>) -> StResult<usize> {
    netfd::recvmsg(fd, msg, flags, timeout)
}

/// Non-blocking `sendmsg(2)` (`st_sendmsg`).
pub fn sendmsg(fd: &NetFd, msg: &libc::msghdr, flags: i32, timeout: Option<Duration>) -> StResult<usize> {
    netfd::sendmsg(fd, msg, flags, timeout)
}

/// Open a path as a non-blocking descriptor from the start (`st_open`).
pub fn open(path: &std::ffi::CStr, flags: i32, mode: libc::mode_t) -> StResult<NetFd> {
    netfd::open(path, flags, mode)
}
