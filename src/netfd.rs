// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The non-blocking descriptor façade and socket operations (spec component
//! C8), grounded on st-srs's `io.c`. Every blocking-looking call here either
//! completes the underlying syscall immediately or suspends the calling
//! coroutine until the descriptor is ready, via [`poll`].
//!
//! Descriptor records are recycled through a `slab::Slab` rather than
//! st-srs's hand-rolled intrusive free list (`_st_netfd_freelist`) — a slab
//! gives the same O(1) reuse without us hand-writing the free-list
//! bookkeeping `clist.rs` already owns for queues that need FIFO order
//! (this one doesn't).

use std::any::Any;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use slab::Slab;

use crate::coroutine::State;
use crate::error::{StError, StResult};
use crate::event::{PollEvents, PollFd, PollRequest};
use crate::vp;

/// A per-descriptor destructor, run when a value set via
/// [`NetFd::setspecific`] is replaced or the descriptor is closed.
pub type FdDestructor = Box<dyn Fn(Box<dyn Any>)>;

struct FdRecord {
    private_data: Option<Box<dyn Any>>,
    destructor: Option<FdDestructor>,
}

// `UnsafeCell`, not `RefCell`: `getspecific` hands back a `&dyn Any`
// borrowed from a slot here, and under cooperative single-OS-thread
// scheduling nothing else can mutate this table while that borrow is
// alive (the same reasoning `sync.rs`'s module doc gives for `Mutex`/
// `CondVar`).
thread_local! {
    static FD_RECORDS: UnsafeCell<Slab<FdRecord>> = UnsafeCell::new(Slab::new());
}

fn with_records<R>(f: impl FnOnce(&mut Slab<FdRecord>) -> R) -> R {
    FD_RECORDS.with(|cell| {
        // SAFETY: single-OS-thread, non-reentrant access; no call here
        // suspends the current coroutine while holding this `&mut`.
        f(unsafe { &mut *cell.get() })
    })
}

/// A non-blocking wrapper over an OS descriptor (`_st_netfd_t`). Closing is
/// explicit via [`NetFd::close`]; dropping one without closing it leaks the
/// OS descriptor, matching st-srs's own "you must call `st_netfd_close`"
/// contract (nothing in the C original closes a `netfd` implicitly either).
pub struct NetFd {
    fd: RawFd,
    slot: usize,
}

impl std::fmt::Debug for NetFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetFd").field("fd", &self.fd).finish()
    }
}

fn set_nonblocking(fd: RawFd, is_socket: bool) -> StResult<()> {
    if is_socket {
        let mut one: libc::c_int = 1;
        // SAFETY: `fd` is a valid, just-accepted-or-opened socket descriptor.
        if unsafe { libc::ioctl(fd, libc::FIONBIO, &mut one) } == 0 {
            return Ok(());
        }
        // Fall through to the POSIX two-step dance if FIONBIO isn't
        // supported for this descriptor type.
    }
    // SAFETY: `fd` is valid for the duration of these two calls.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(StError::from_errno());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(StError::from_errno());
        }
    }
    Ok(())
}

fn new_netfd(fd: RawFd, nonblock: bool, is_socket: bool) -> StResult<NetFd> {
    vp::event_fd_new(fd);
    if nonblock {
        if let Err(e) = set_nonblocking(fd, is_socket) {
            // SAFETY: `fd` was never handed to the caller; closing it here
            // on the failure path is ours to do.
            unsafe { libc::close(fd) };
            return Err(e);
        }
    }
    let slot = with_records(|r| r.insert(FdRecord { private_data: None, destructor: None }));
    Ok(NetFd { fd, slot })
}

impl NetFd {
    /// Wrap an already-open descriptor, setting non-blocking mode via the
    /// POSIX get-flags/set-flags dance (`st_netfd_open`).
    pub fn open(fd: RawFd) -> StResult<NetFd> {
        new_netfd(fd, true, false)
    }

    /// Wrap an already-open socket, setting non-blocking mode with a single
    /// `ioctl(FIONBIO)` (`st_netfd_open_socket`).
    pub fn open_socket(fd: RawFd) -> StResult<NetFd> {
        new_netfd(fd, true, true)
    }

    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    /// Attach a user value and its destructor, replacing and destroying
    /// whatever was set previously (`st_netfd_setspecific`).
    pub fn setspecific(&mut self, value: Box<dyn Any>, destructor: Option<FdDestructor>) {
        with_records(|r| {
            let rec = &mut r[self.slot];
            if let (Some(old), Some(d)) = (rec.private_data.take(), rec.destructor.take()) {
                d(old);
            }
            rec.private_data = Some(value);
            rec.destructor = Some(destructor.unwrap_or_else(|| Box::new(|_| {})));
        });
    }

    /// Borrow the user value set via [`setspecific`](Self::setspecific), if
    /// any (`st_netfd_getspecific`).
    ///
    /// # Safety reasoning
    /// The returned reference is only ever read back on this same OS
    /// thread, and nothing mutates this slot (`setspecific`, `close`) while
    /// the borrow is outstanding under cooperative single-threaded
    /// scheduling — same argument `thread_getspecific` makes.
    pub fn getspecific(&self) -> Option<&dyn Any> {
        with_records(|r| r[self.slot].private_data.as_deref()).map(|v| {
            // SAFETY: see the doc comment above; the slab entry's address
            // is stable across inserts (no reallocation moves existing
            // entries) as long as this `NetFd`'s slot isn't removed.
            unsafe { &*(v as *const dyn Any) }
        })
    }

    /// Run `f` with a reference to the user value, if one is set.
    pub fn with_specific<R>(&self, f: impl FnOnce(Option<&dyn Any>) -> R) -> R {
        with_records(|r| f(r[self.slot].private_data.as_deref()))
    }

    /// Wait for `events` readiness on this single descriptor
    /// (`st_netfd_poll`).
    ///
    /// # Errors
    /// [`StError::TimedOut`] if `timeout` elapses first; [`StError::BadFd`]
    /// if the descriptor is found invalid while waiting.
    pub fn netfd_poll(&self, events: PollEvents, timeout: Option<Duration>) -> StResult<()> {
        poll_one(self.fd, events, timeout)
    }

    /// Close the underlying descriptor, run any destructor, and release the
    /// slab slot (`st_netfd_close`).
    ///
    /// # Errors
    /// [`StError::Busy`] if the event backend still has outstanding
    /// interest registered on this descriptor (a poll request naming it is
    /// still live); the descriptor is left open in that case.
    pub fn close(mut self) -> StResult<()> {
        vp::event_fd_close(self.fd)?;
        self.release();
        // SAFETY: `self.fd` is a valid, currently-open descriptor this
        // `NetFd` uniquely owns.
        if unsafe { libc::close(self.fd) } < 0 {
            return Err(StError::from_errno());
        }
        Ok(())
    }

    fn release(&mut self) {
        with_records(|r| {
            if let Some(rec) = r.try_remove(self.slot) {
                if let (Some(v), Some(d)) = (rec.private_data, rec.destructor) {
                    d(v);
                }
            }
        });
    }
}

fn poll_one(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> StResult<()> {
    let mut pds = [PollFd::new(fd, events)];
    let n = poll(&mut pds, timeout)?;
    if pds[0].revents.contains(PollEvents::INVALID) {
        return Err(StError::BadFd);
    }
    if n == 0 {
        return Err(StError::TimedOut);
    }
    Ok(())
}

/// `poll(pds, n, timeout)`: register interest in every descriptor in `pds`,
/// suspend until at least one fires (or `timeout` elapses, or the caller is
/// interrupted), then report how many have nonzero `revents`.
///
/// A zero-length `pds` with a finite timeout degrades to a plain sleep (the
/// poll request still gets linked onto the I/O queue and the sleep heap,
/// but no descriptor can ever satisfy it, so only the timeout or an
/// interrupt can wake it — matching spec.md §8's "behaves exactly like
/// `usleep`" boundary case without special-casing it here).
///
/// # Errors
/// [`StError::Interrupted`] if the interrupt flag is already set, or fires
/// while waiting. Any error the event backend's `pollset_add` returns.
pub fn poll(pds: &mut [PollFd], timeout: Option<Duration>) -> StResult<usize> {
    let me = vp::current();
    if vp::take_interrupt(me) {
        return Err(StError::Interrupted);
    }

    let req = PollRequest::new(me, pds.to_vec());
    let req_ptr = NonNull::new(Box::into_raw(req)).expect("Box::into_raw never returns null");

    if let Err(e) = vp::io_register(req_ptr) {
        // SAFETY: `req_ptr` was never linked anywhere; it's solely owned
        // here.
        unsafe { drop(Box::from_raw(req_ptr.as_ptr())) };
        return Err(e);
    }
    unsafe { (*me.as_ptr()).io_req = Some(req_ptr) };

    vp::sleep_q_add(me, timeout);
    vp::block_current(State::IoWait);

    unsafe { (*me.as_ptr()).io_req = None };
    if timeout.is_some() {
        vp::sleep_q_remove(me);
    }
    vp::clear_timed_out(me);

    // SAFETY: still valid — either the event backend unlinked it from the
    // I/O queue (readiness) or it's still there (timeout/interrupt), but
    // either way nothing has freed it yet.
    let on_ioq = unsafe { (*req_ptr.as_ptr()).on_ioq };
    if on_ioq {
        vp::io_deregister(req_ptr);
    }

    // SAFETY: sole owner, reclaiming the allocation `Box::into_raw` leaked.
    let boxed = unsafe { Box::from_raw(req_ptr.as_ptr()) };
    for (slot, filled) in pds.iter_mut().zip(boxed.fds.iter()) {
        slot.revents = filled.revents;
    }
    let ready = boxed.ready_count();
    drop(boxed);

    if vp::take_interrupt(me) {
        return Err(StError::Interrupted);
    }
    Ok(ready)
}

/// Single-attempt retry loop shared by the non-residual calls (`read`,
/// `readv`, `recvfrom`, `sendto`, `recvmsg`, `sendmsg`): retries on `EINTR`,
/// suspends-then-retries on "would block", returns whatever the syscall
/// reports on the first attempt that isn't one of those (possibly a short
/// count — these calls never loop to fill the caller's buffer).
fn retry_once(fd: RawFd, events: PollEvents, timeout: Option<Duration>, mut attempt: impl FnMut() -> isize) -> StResult<isize> {
    loop {
        let n = attempt();
        if n >= 0 {
            return Ok(n);
        }
        let err = StError::from_errno();
        if err.is_eintr() {
            continue;
        }
        if err.is_would_block() {
            poll_one(fd, events, timeout)?;
            continue;
        }
        return Err(err);
    }
}

/// The generic residual-tracking loop behind `write`/`writev`/`read_fully`
/// (spec.md §10's supplemented feature): walks a private iovec cursor,
/// retrying the syscall until every byte is accounted for or EOF/error
/// ends the loop early. Never mutates the caller's buffers directly —
/// `iov` is this call's own scratch copy.
///
/// `single`/`vectored` are the one-buffer and many-buffer syscall
/// attempts; this collapses what st-srs keeps as four near-identical
/// `_resid` functions (read and write, each scalar and vectored) into one
/// walk parameterized over which syscall to try.
fn resid_loop(
    fd: RawFd,
    mut iov: Vec<libc::iovec>,
    events: PollEvents,
    timeout: Option<Duration>,
    single: impl Fn(RawFd, *mut c_void, usize) -> isize,
    vectored: impl Fn(RawFd, *const libc::iovec, i32) -> isize,
) -> StResult<usize> {
    let total: usize = iov.iter().map(|v| v.iov_len).sum();
    let mut idx = 0usize;
    let mut remaining = iov.len();

    while remaining > 0 {
        let n = if remaining == 1 {
            single(fd, iov[idx].iov_base, iov[idx].iov_len)
        } else {
            vectored(fd, iov[idx..].as_ptr(), remaining as i32)
        };

        if n < 0 {
            let err = StError::from_errno();
            if err.is_eintr() {
                continue;
            }
            if !err.is_would_block() {
                return Err(err);
            }
        } else if n == 0 {
            // EOF: report whatever was transferred so far.
            break;
        } else {
            let mut n = n as usize;
            while n > 0 && remaining > 0 {
                let cur = &mut iov[idx];
                if n >= cur.iov_len {
                    n -= cur.iov_len;
                    cur.iov_len = 0;
                    idx += 1;
                    remaining -= 1;
                } else {
                    cur.iov_base = unsafe { (cur.iov_base as *mut u8).add(n) as *mut c_void };
                    cur.iov_len -= n;
                    n = 0;
                }
            }
            if remaining == 0 {
                break;
            }
        }

        poll_one(fd, events, timeout)?;
    }

    let left: usize = iov[idx..].iter().map(|v| v.iov_len).sum();
    Ok(total - left)
}

fn one_iovec(buf: *mut c_void, len: usize) -> libc::iovec {
    libc::iovec { iov_base: buf, iov_len: len }
}

/// `read(fd, buf, timeout)`: a single non-blocking `read(2)`, retried on
/// `EINTR`/readiness but never looped to fill `buf` — a short read is
/// returned as-is, matching st-srs's `st_read`.
///
/// # Errors
/// [`StError::TimedOut`] if `timeout` elapses while waiting for readability.
pub fn read(fd: &NetFd, buf: &mut [u8], timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let ptr = buf.as_mut_ptr().cast::<c_void>();
    let len = buf.len();
    let n = retry_once(osfd, PollEvents::READ, timeout, || unsafe { libc::read(osfd, ptr, len) })?;
    Ok(n as usize)
}

/// `read_fully(fd, buf, timeout)`: loops until `buf` is completely filled,
/// EOF is hit, or an error occurs (spec.md §10's residual read).
pub fn read_fully(fd: &NetFd, buf: &mut [u8], timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let iov = vec![one_iovec(buf.as_mut_ptr().cast(), buf.len())];
    resid_loop(
        osfd,
        iov,
        PollEvents::READ,
        timeout,
        |fd, p, l| unsafe { libc::read(fd, p, l) },
        |fd, iov, n| unsafe { libc::readv(fd, iov, n) },
    )
}

/// `readv(fd, iov, timeout)`: one non-blocking vectored read, same
/// short-read contract as [`read`].
pub fn readv(fd: &NetFd, iov: &mut [std::io::IoSliceMut<'_>], timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let raw: Vec<libc::iovec> = iov.iter_mut().map(|s| one_iovec(s.as_mut_ptr().cast(), s.len())).collect();
    let n = retry_once(osfd, PollEvents::READ, timeout, || unsafe { libc::readv(osfd, raw.as_ptr(), raw.len() as i32) })?;
    Ok(n as usize)
}

/// `write(fd, buf, timeout)`: loops until every byte in `buf` is written or
/// an error occurs (st-srs's `st_write`, implemented via `st_write_resid`).
pub fn write(fd: &NetFd, buf: &[u8], timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let iov = vec![one_iovec(buf.as_ptr().cast::<c_void>() as *mut c_void, buf.len())];
    resid_loop(
        osfd,
        iov,
        PollEvents::WRITE,
        timeout,
        |fd, p, l| unsafe { libc::write(fd, p, l) },
        |fd, iov, n| unsafe { libc::writev(fd, iov, n) },
    )
}

/// `writev(fd, iov, timeout)`: vectored counterpart of [`write`], same
/// full-transfer contract.
pub fn writev(fd: &NetFd, iov: &[std::io::IoSlice<'_>], timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let raw: Vec<libc::iovec> = iov.iter().map(|s| one_iovec(s.as_ptr().cast::<c_void>() as *mut c_void, s.len())).collect();
    resid_loop(
        osfd,
        raw,
        PollEvents::WRITE,
        timeout,
        |fd, p, l| unsafe { libc::write(fd, p, l) },
        |fd, iov, n| unsafe { libc::writev(fd, iov, n) },
    )
}

/// `accept(fd, addr, timeout)`: waits for read-readiness on a listening
/// descriptor, then wraps the new connection as a socket `NetFd`.
///
/// # Errors
/// [`StError::Interrupted`] if interrupted before a connection arrives.
pub fn accept(fd: &NetFd, addr: Option<&mut libc::sockaddr_storage>, timeout: Option<Duration>) -> StResult<NetFd> {
    let osfd = fd.fd;
    let (addr_ptr, mut addrlen) = match &addr {
        Some(a) => (*a as *const _ as *mut libc::sockaddr, std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t),
        None => (std::ptr::null_mut(), 0),
    };
    let mut addrlen_mut = addrlen;
    let new_fd = loop {
        let rv = unsafe { libc::accept(osfd, addr_ptr, if addr_ptr.is_null() { std::ptr::null_mut() } else { &mut addrlen_mut }) };
        if rv >= 0 {
            break rv;
        }
        let err = StError::from_errno();
        if err.is_eintr() {
            continue;
        }
        if !err.is_would_block() {
            return Err(err);
        }
        poll_one(osfd, PollEvents::READ, timeout)?;
    };
    addrlen = addrlen_mut;
    let _ = addrlen;
    // Linux (and every target this crate supports) does not inherit the
    // listening socket's non-blocking flag onto an accepted connection, so
    // the new descriptor always needs its own non-blocking dance — unlike
    // st-srs's `MD_ACCEPT_NB_INHERITED` platforms.
    match NetFd::open_socket(new_fd) {
        Ok(nf) => Ok(nf),
        Err(e) => {
            // SAFETY: `new_fd` was never handed out; ours to close on the
            // failure path.
            unsafe { libc::close(new_fd) };
            Err(e)
        }
    }
}

/// `connect(fd, addr, timeout)`: issues the raw `connect(2)`, waiting for
/// write-readiness on "in progress", then reads back `SO_ERROR`.
pub fn connect(fd: &NetFd, addr: &libc::sockaddr, addrlen: libc::socklen_t, timeout: Option<Duration>) -> StResult<()> {
    let osfd = fd.fd;
    let mut interrupted_once = false;
    loop {
        let rv = unsafe { libc::connect(osfd, addr as *const _, addrlen) };
        if rv == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        let errno = err.raw_os_error();
        if errno == Some(libc::EINTR) {
            interrupted_once = true;
            continue;
        }
        let in_progress = errno == Some(libc::EINPROGRESS);
        // A prior EINTR can make a subsequent connect() on some platforms
        // report EADDRINUSE instead of EINPROGRESS for the same attempt
        // (Stevens, UNPv1 2nd ed., p.413); only swallow it once.
        let addr_in_use_after_eintr = errno == Some(libc::EADDRINUSE) && interrupted_once;
        if !in_progress && !addr_in_use_after_eintr {
            return Err(StError::Io(err));
        }
        poll_one(osfd, PollEvents::WRITE, timeout)?;
        let mut sockerr: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `sockerr`/`len` are valid, appropriately sized out-params.
        let rv = unsafe { libc::getsockopt(osfd, libc::SOL_SOCKET, libc::SO_ERROR, &mut sockerr as *mut _ as *mut c_void, &mut len) };
        if rv < 0 {
            return Err(StError::from_errno());
        }
        if sockerr != 0 {
            return Err(StError::Io(std::io::Error::from_raw_os_error(sockerr)));
        }
        return Ok(());
    }
}

/// `recvfrom(fd, buf, from, timeout)`.
pub fn recvfrom(fd: &NetFd, buf: &mut [u8], from: Option<&mut libc::sockaddr_storage>, timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let ptr = buf.as_mut_ptr().cast::<c_void>();
    let len = buf.len();
    let (from_ptr, mut fromlen) = match &from {
        Some(a) => (*a as *const _ as *mut libc::sockaddr, std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t),
        None => (std::ptr::null_mut(), 0),
    };
    let n = retry_once(osfd, PollEvents::READ, timeout, || unsafe {
        libc::recvfrom(osfd, ptr, len, 0, from_ptr, if from_ptr.is_null() { std::ptr::null_mut() } else { &mut fromlen })
    })?;
    Ok(n as usize)
}

/// `sendto(fd, buf, to, timeout)`.
pub fn sendto(fd: &NetFd, buf: &[u8], to: &libc::sockaddr, tolen: libc::socklen_t, timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let ptr = buf.as_ptr().cast::<c_void>();
    let len = buf.len();
    let n = retry_once(osfd, PollEvents::WRITE, timeout, || unsafe { libc::sendto(osfd, ptr, len, 0, to as *const _, tolen) })?;
    Ok(n as usize)
}

/// `recvmsg(fd, msg, flags, timeout)`.
pub fn recvmsg(fd: &NetFd, msg: &mut libc::msghdr, flags: i32, timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let msg_ptr = msg as *mut libc::msghdr;
    let n = retry_once(osfd, PollEvents::READ, timeout, || unsafe { libc::recvmsg(osfd, msg_ptr, flags) })?;
    Ok(n as usize)
}

/// `sendmsg(fd, msg, flags, timeout)`.
pub fn sendmsg(fd: &NetFd, msg: &libc::msghdr, flags: i32, timeout: Option<Duration>) -> StResult<usize> {
    let osfd = fd.fd;
    let msg_ptr = msg as *const libc::msghdr;
    let n = retry_once(osfd, PollEvents::WRITE, timeout, || unsafe { libc::sendmsg(osfd, msg_ptr, flags) })?;
    Ok(n as usize)
}

/// `open(path, flags, mode)`: opens a non-socket descriptor (a FIFO, a
/// regular file used non-blockingly) in non-blocking mode from the start,
/// retrying only on `EINTR` (`st_open`).
pub fn open(path: &std::ffi::CStr, flags: i32, mode: libc::mode_t) -> StResult<NetFd> {
    let fd = loop {
        let rv = unsafe { libc::open(path.as_ptr(), flags | libc::O_NONBLOCK, mode as libc::c_int) };
        if rv >= 0 {
            break rv;
        }
        let err = StError::from_errno();
        if err.is_eintr() {
            continue;
        }
        return Err(err);
    };
    match new_netfd(fd, false, false) {
        Ok(nf) => Ok(nf),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resid_loop_reports_bytes_already_consumed_at_eof() {
        // Exercised end-to-end (pipe read/write) in `tests/netfd_test.rs`;
        // the arithmetic here (remaining = sum of iov_len left) is covered
        // implicitly there since constructing a real fd is required to
        // drive the loop at all.
    }

    #[test]
    fn one_iovec_wraps_pointer_and_len() {
        let mut buf = [0u8; 8];
        let iov = one_iovec(buf.as_mut_ptr().cast(), buf.len());
        assert_eq!(iov.iov_len, 8);
    }
}
