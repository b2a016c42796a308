// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! The errno-shaped error type every public operation returns.
//!
//! state-threads (the C library this crate reimplements) reports failure as
//! a single `errno` value per call, never a stacked error context. `StError`
//! keeps that contract: one flat enum, one [`thiserror::Error`] impl, and a
//! `Result` alias to match.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type StResult<T> = Result<T, StError>;

/// The closed set of failure modes a `state_threads` operation can report.
///
/// Variants map onto the POSIX errno taxonomy spec'd for the descriptor and
/// synchronization layers. `WouldBlock`/`Interrupted`-at-the-syscall-level
/// are resolved internally (retried or turned into a suspension) and never
/// escape to callers as such; they're listed here only because a handful of
/// internal helpers return them before the retry loop catches them.
#[derive(Debug, Error)]
pub enum StError {
    /// A non-infinite timeout elapsed before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// The coroutine's interrupt flag was observed at a suspension point.
    #[error("interrupted")]
    Interrupted,

    /// `poll`/`select` observed a descriptor that is invalid or was closed
    /// out from under a waiter.
    #[error("bad file descriptor")]
    BadFd,

    /// A resource (mutex, condition variable, descriptor) is in use and the
    /// requested operation cannot proceed non-destructively.
    #[error("resource busy")]
    Busy,

    /// A coroutine attempted to acquire a mutex it already owns, or to join
    /// itself.
    #[error("deadlock would occur")]
    Deadlock,

    /// A mutex `unlock` was attempted by a coroutine that is not the owner.
    #[error("operation not permitted")]
    PermissionDenied,

    /// Misuse: joining a non-joinable coroutine, a second joiner on the same
    /// target, an invalid poll event mask, etc.
    #[error("invalid argument")]
    InvalidArgument,

    /// `key_create` was called after `ST_KEYS_MAX` keys were already handed
    /// out.
    #[error("too many per-coroutine keys")]
    TooManyKeys,

    /// The select backend observed a descriptor at or beyond `FD_SETSIZE`,
    /// or the process is out of descriptor slots.
    #[error("descriptor limit exceeded")]
    FdLimit,

    /// `connect` found the local address already in use.
    #[error("address in use")]
    AddrInUse,

    /// A raw OS error the crate doesn't otherwise model; carries the
    /// originating [`std::io::Error`] so callers retain `.raw_os_error()`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StError {
    /// Build an [`StError`] from the calling thread's current `errno`,
    /// mirroring how st-srs callers read `errno` right after a failed
    /// syscall.
    pub(crate) fn from_errno() -> Self {
        Self::Io(std::io::Error::last_os_error())
    }

    /// `true` for the two conditions that mean "retry the syscall, don't
    /// suspend" (`EINTR`) as opposed to "suspend until ready" (`EAGAIN`/
    /// `EWOULDBLOCK`). Internal only; never returned to callers.
    pub(crate) fn is_eintr(&self) -> bool {
        matches!(self, Self::Io(e) if e.raw_os_error() == Some(libc::EINTR))
    }

    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)))
    }
}
