// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! Clock sampling and the optional second-resolution time cache (supplemented
//! feature, see `SPEC_FULL.md` §10), grounded on st-srs's `sync.c`
//! (`st_utime`, `st_time`, `st_timecache_set`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

type UtimeFn = fn() -> u64;

fn default_utime() -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_micros() as u64
}

fn utime_override() -> &'static RwLock<Option<UtimeFn>> {
    static CELL: OnceLock<RwLock<Option<UtimeFn>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(None))
}

/// Override the clock source process-wide (`st_set_utime_function`). Tests
/// use this to drive deterministic virtual clocks instead of the wall
/// clock.
pub fn set_utime_function(f: Option<UtimeFn>) {
    *utime_override().write().expect("utime override lock poisoned") = f;
}

/// The current time in microseconds, per whichever clock source is
/// configured (`st_utime`).
pub fn utime_now() -> u64 {
    match *utime_override().read().expect("utime override lock poisoned") {
        Some(f) => f(),
        None => default_utime(),
    }
}

static TIMECACHE_ENABLED: AtomicBool = AtomicBool::new(false);
static CACHED_SECONDS: AtomicU64 = AtomicU64::new(0);
static CACHED_AT: AtomicU64 = AtomicU64::new(0);

/// Enable or disable the second-resolution wall-clock cache
/// (`st_timecache_set`). Disabled by default, matching the original's
/// opt-in posture (most callers use `st_utime` directly; the cache exists
/// for call sites that want a cheap `time(2)`-shaped value instead).
pub fn timecache_set(enabled: bool) {
    TIMECACHE_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled {
        CACHED_AT.store(0, Ordering::SeqCst);
    }
}

/// The cached wall-clock second count, refreshed at most once a second by
/// [`refresh_cache_if_due`] (called from `vp::check_clock`); falls back to
/// sampling directly when the cache is disabled.
pub fn time_seconds() -> u64 {
    if TIMECACHE_ENABLED.load(Ordering::SeqCst) {
        CACHED_SECONDS.load(Ordering::SeqCst)
    } else {
        utime_now() / 1_000_000
    }
}

/// Called once per scheduler tick; refreshes the cached second count if a
/// full second has elapsed and the cache is enabled. `now` is in
/// microseconds, matching `utime_now`'s unit.
pub fn refresh_cache_if_due(now: u64) {
    if !TIMECACHE_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let now_secs = now / 1_000_000;
    let cached_at = CACHED_AT.load(Ordering::SeqCst);
    if now_secs != cached_at {
        CACHED_SECONDS.store(now_secs, Ordering::SeqCst);
        CACHED_AT.store(now_secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn override_clock_is_used() {
        set_utime_function(Some(|| 42));
        assert_eq!(utime_now(), 42);
        set_utime_function(None);
    }

    #[test]
    #[serial]
    fn timecache_reflects_refreshed_value() {
        timecache_set(true);
        refresh_cache_if_due(5_000_000);
        assert_eq!(time_seconds(), 5);
        refresh_cache_if_due(5_999_999);
        assert_eq!(time_seconds(), 5);
        refresh_cache_if_due(6_000_000);
        assert_eq!(time_seconds(), 6);
        timecache_set(false);
    }
}
