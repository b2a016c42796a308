// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! Per-coroutine keyed storage (spec component C9), grounded on st-srs's
//! `key.c`.
//!
//! A fixed number of process-wide "keys" (like pthread TSD), each with an
//! optional destructor, and per-coroutine storage slots indexed by key.
//! `key_create` hands out keys from a monotonically increasing counter
//! shared by every VP in the process, exactly like the original's
//! `_st_key_max` — there's no meaningful way to free a key once created
//! (coroutines on other VPs might still hold values for it), so the
//! counter never goes back down.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use crate::error::{StError, StResult};

/// `ST_KEYS_MAX` in the original: the number of per-coroutine storage
/// slots reserved up front.
pub const KEYS_MAX: usize = 16;

/// A destructor: called with a slot's value at coroutine exit, once per
/// key that has a non-`None` value in that coroutine.
pub type Destructor = Box<dyn Fn(Box<dyn Any>) + Send + Sync>;

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

fn destructors() -> &'static StdMutex<Vec<Option<Destructor>>> {
    static TABLE: std::sync::OnceLock<StdMutex<Vec<Option<Destructor>>>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| StdMutex::new(Vec::new()))
}

/// An opaque per-coroutine storage key, returned by [`key_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(usize);

/// Allocate a new key, process-wide, optionally with a destructor run on
/// each coroutine's exit for any value it has stored under this key.
///
/// # Errors
/// Returns [`StError::TooManyKeys`] once [`KEYS_MAX`] keys have been
/// created (`st_key_create`'s `ST_ERROR` path in the original).
pub fn key_create(destructor: Option<Destructor>) -> StResult<Key> {
    let idx = NEXT_KEY.fetch_add(1, Ordering::SeqCst);
    if idx >= KEYS_MAX {
        return Err(StError::TooManyKeys);
    }
    let mut table = destructors().lock().expect("key destructor table poisoned");
    if table.len() <= idx {
        table.resize_with(idx + 1, || None);
    }
    table[idx] = destructor;
    Ok(Key(idx))
}

/// The fixed maximum number of keys a process may ever create
/// (`st_key_getlimit`); always [`KEYS_MAX`], regardless of how many have
/// actually been handed out so far.
pub fn key_getlimit() -> usize {
    KEYS_MAX
}

pub(crate) fn index_of(key: Key) -> usize {
    key.0
}

/// Run every key's destructor over the exiting coroutine's non-empty
/// slots, exactly like `_st_thread_cleanup`'s key-destructor loop.
pub(crate) fn run_destructors(slots: &mut [crate::coroutine::KeySlot; KEYS_MAX]) {
    let table = destructors().lock().expect("key destructor table poisoned");
    for (idx, slot) in slots.iter_mut().enumerate() {
        if let Some(value) = slot.value.take() {
            if let Some(Some(destructor)) = table.get(idx) {
                destructor(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn key_create_assigns_increasing_indices() {
        let k1 = key_create(None).unwrap();
        let k2 = key_create(None).unwrap();
        assert_ne!(index_of(k1), index_of(k2));
    }

    #[test]
    #[serial]
    fn destructor_runs_on_cleanup() {
        use std::sync::atomic::{AtomicBool, Ordering as O};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let key = key_create(Some(Box::new(move |_v| ran2.store(true, O::SeqCst)))).unwrap();

        let mut slots: [crate::coroutine::KeySlot; KEYS_MAX] = std::array::from_fn(|_| crate::coroutine::KeySlot::default());
        slots[index_of(key)].value = Some(Box::new(42i32));
        run_destructors(&mut slots);
        assert!(ran.load(O::SeqCst));
    }
}
