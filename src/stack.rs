// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! Coroutine stack allocation, caching, guard pages and randomization
//! (spec component C2), grounded on st-srs's `stk.c`.
//!
//! Each [`Stack`] is its own anonymous `mmap` region: `usable + 2 * page`
//! bytes, plus one more page if randomization is enabled. The two end pages
//! are optionally `mprotect`'d to `PROT_NONE` as guard zones. [`Stack`]
//! implements `context::stack::Stack` so it can be handed straight to
//! `context::Context::new`.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::clist::Link;
use crate::error::{StError, StResult};

/// Default usable stack size (st-srs's `ST_DEFAULT_STACK_SIZE`): 128 KiB,
/// enough for conventional coroutine bodies on a 64-bit target.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// A single coroutine's stack: an mmap'd region with optional guard pages
/// and a random start-offset, plus the cache-list link it sits on while
/// idle.
pub struct Stack {
    pub link: Link,
    /// Base address of the whole mapping (includes guard pages and the
    /// randomization pad).
    vaddr: NonNull<u8>,
    vaddr_size: usize,
    /// Usable bottom (low address, after the leading guard page and any
    /// random offset) and top (high address, stack pointer starts here).
    stk_bottom: NonNull<u8>,
    stk_top: NonNull<u8>,
    /// Usable size requested by the caller (`>=` what was asked for).
    stk_size: usize,
    guarded: bool,
}

// Stacks are only ever touched by the VP that owns them; they're moved
// between a VP's cache list and a live coroutine, never shared.
unsafe impl Send for Stack {}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("stk_size", &self.stk_size)
            .field("guarded", &self.guarded)
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

fn round_up(n: usize, multiple: usize) -> usize {
    debug_assert!(multiple.is_power_of_two() || multiple > 0);
    n.div_ceil(multiple) * multiple
}

impl Stack {
    /// Allocate a fresh stack of at least `usable_size` bytes (0 means the
    /// default). `guard_pages` mirrors st-srs's debug-only `mprotect`
    /// calls; `randomize` mirrors `st_randomize_stacks`.
    pub fn new(usable_size: usize, guard_pages: bool, randomize: bool) -> StResult<Stack> {
        let page = page_size();
        let usable = round_up(if usable_size == 0 { DEFAULT_STACK_SIZE } else { usable_size }, page);
        let extra = if randomize { page } else { 0 };
        let vaddr_size = usable + 2 * page + extra;

        // SAFETY: standard anonymous private mapping, no fd involved.
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                vaddr_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(StError::from_errno());
        }
        let vaddr = NonNull::new(map.cast::<u8>()).expect("mmap returned null on success");

        if guard_pages {
            // SAFETY: both regions are within the mapping just created.
            unsafe {
                libc::mprotect(vaddr.as_ptr().cast(), page, libc::PROT_NONE);
                libc::mprotect(vaddr.as_ptr().add(usable + page).cast(), page + extra, libc::PROT_NONE);
            }
        }

        let mut stk_bottom = unsafe { vaddr.as_ptr().add(page) };
        let mut stk_top = unsafe { stk_bottom.add(usable) };

        if extra > 0 {
            use rand::Rng;
            // 16-byte-aligned random offset in [0, page).
            let offset = (rand::thread_rng().gen_range(0..extra)) & !0xf;
            // SAFETY: offset < extra, which is the slack we reserved.
            unsafe {
                stk_bottom = stk_bottom.add(offset);
                stk_top = stk_top.add(offset);
            }
        }

        Ok(Stack {
            link: Link::new(),
            vaddr,
            vaddr_size,
            stk_bottom: NonNull::new(stk_bottom).unwrap(),
            stk_top: NonNull::new(stk_top).unwrap(),
            stk_size: usable,
            guarded: guard_pages,
        })
    }

    pub fn usable_size(&self) -> usize {
        self.stk_size
    }

    /// Unmap this stack's whole region. Called either directly (caching
    /// disabled) or when sweeping the free list before a fresh allocation.
    fn unmap(&mut self) {
        // SAFETY: `vaddr`/`vaddr_size` describe exactly the mapping `new`
        // created; this is only called once, right before the Stack itself
        // is dropped or forgotten.
        unsafe {
            if self.guarded {
                // Guard pages must be made writable again before unmapping
                // on some platforms' debug allocators; munmap alone is
                // sufficient on Linux/BSD but st-srs restores protection
                // first for tooling that tracks mapped-readable ranges.
                let page = page_size();
                libc::mprotect(self.vaddr.as_ptr().cast(), page, libc::PROT_READ | libc::PROT_WRITE);
            }
            libc::munmap(self.vaddr.as_ptr().cast(), self.vaddr_size);
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.unmap();
    }
}

// SAFETY: `context::stack::Stack` only requires that `top()`/`bottom()`
// describe a valid, stable stack-growth range for as long as a `Context`
// built over it is alive, which our mmap'd region satisfies.
unsafe impl context::stack::Stack for Stack {
    fn top(&self) -> *mut c_void {
        self.stk_top.as_ptr().cast()
    }

    fn bottom(&self) -> *mut c_void {
        self.stk_bottom.as_ptr().cast()
    }
}

/// Per-VP stack allocator state: the free-stack cache plus the two
/// policies (`cache_stacks`, `randomize`) st-srs exposes as compile-time
/// (`MD_CACHE_STACK`) and runtime (`st_randomize_stacks`) switches
/// respectively. We make caching a runtime switch too since there's no
/// reason a Rust build needs to fix it at compile time.
pub struct StackAllocator {
    free_list: Vec<Stack>,
    pub cache_stacks: bool,
    pub randomize: bool,
    pub guard_pages: bool,
}

impl StackAllocator {
    pub fn new() -> Self {
        StackAllocator {
            free_list: Vec::new(),
            cache_stacks: true,
            randomize: false,
            guard_pages: cfg!(debug_assertions),
        }
    }

    /// Allocate a stack of at least `usable_size` bytes, reusing a cached
    /// one if caching is enabled and one is big enough.
    pub fn alloc(&mut self, usable_size: usize) -> StResult<Stack> {
        let usable_size = if usable_size == 0 { DEFAULT_STACK_SIZE } else { usable_size };

        if self.cache_stacks {
            if let Some(pos) = self.free_list.iter().position(|s| s.usable_size() >= usable_size) {
                tracing::trace!(usable_size, "stack cache hit");
                return Ok(self.free_list.remove(pos));
            }
        } else {
            // Caching disabled: we can't free in-flight stacks inline (the
            // caller of thread_exit might still be running on one), so
            // sweep whatever accumulated on the free list before a fresh
            // mmap, exactly like st-srs's #ifndef MD_CACHE_STACK path.
            self.free_list.clear();
        }

        tracing::trace!(usable_size, "stack cache miss, mapping new stack");
        Stack::new(usable_size, self.guard_pages, self.randomize)
    }

    /// Return a stack to the cache (or drop it immediately if caching is
    /// disabled, deferred to the next `alloc`'s sweep).
    pub fn free(&mut self, stack: Stack) {
        if self.cache_stacks {
            self.free_list.push(stack);
        }
        // else: drop right here is also fine since nothing but the
        // just-exited coroutine could have been using it, and that
        // coroutine is done; we keep the "sweep on next alloc" behavior
        // only for fidelity with st-srs's documented caution, not because
        // it's required in our design (the record is not stack-resident).
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_requested_size_rounded_to_page() {
        let stack = Stack::new(4096, false, false).unwrap();
        assert!(stack.usable_size() >= 4096);
    }

    #[test]
    fn default_size_used_when_zero_requested() {
        let stack = Stack::new(0, false, false).unwrap();
        assert_eq!(stack.usable_size(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn cache_reuses_big_enough_stack() {
        let mut alloc = StackAllocator::new();
        let s = alloc.alloc(16 * 1024).unwrap();
        let size_before = s.usable_size();
        alloc.free(s);
        assert_eq!(alloc.free_list.len(), 1);
        let s2 = alloc.alloc(8 * 1024).unwrap();
        assert_eq!(s2.usable_size(), size_before);
        assert!(alloc.free_list.is_empty());
    }

    #[test]
    fn disabling_cache_sweeps_free_list_on_next_alloc() {
        let mut alloc = StackAllocator::new();
        let s = alloc.alloc(8 * 1024).unwrap();
        alloc.free(s);
        alloc.cache_stacks = false;
        let _s2 = alloc.alloc(8 * 1024).unwrap();
        assert!(alloc.free_list.is_empty());
    }
}
