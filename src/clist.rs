// Copyright (c) 2025 the state_threads contributors. Licensed under Apache License, Version 2.0.
//! Intrusive circular doubly-linked list (spec component C1).
//!
//! A direct translation of st-srs's `_st_clist_t`: two raw pointers per node,
//! no allocation on insert/remove, container recovery by embedding the link
//! in the owning struct rather than boxing it separately. This is the link
//! type the run queue, I/O queue, zombie queue and every wait queue in this
//! crate are built from.
//!
//! Safety: every node a [`Link`] ever points at must outlive the list it's
//! linked into. The scheduler upholds this by only ever linking
//! [`Coroutine`](crate::coroutine::Coroutine)s it owns via a live
//! [`std::ptr::NonNull`], never a value that can be dropped while linked.

use std::ptr::NonNull;

/// An intrusive link node. Embed one per queue a struct can belong to.
///
/// A freshly [`Link::new`]'d node is self-linked (`next == prev == self`),
/// which doubles as the empty-list sentinel: a list "head" is just a `Link`
/// whose neighbors are itself.
#[derive(Debug)]
pub struct Link {
    pub next: Option<NonNull<Link>>,
    pub prev: Option<NonNull<Link>>,
}

impl Link {
    pub const fn new() -> Self {
        Link { next: None, prev: None }
    }

    /// Self-link, making this node an empty list head.
    ///
    /// # Safety
    /// `this` must be a stable address (not later moved) for as long as it
    /// is used as a list head or is linked into one.
    pub unsafe fn init(this: NonNull<Link>) {
        unsafe {
            (*this.as_ptr()).next = Some(this);
            (*this.as_ptr()).prev = Some(this);
        }
    }

    /// `true` if `this` is an empty list head (self-linked).
    ///
    /// # Safety
    /// `this` must be initialized via [`Link::init`].
    pub unsafe fn is_empty(this: NonNull<Link>) -> bool {
        unsafe { (*this.as_ptr()).next == Some(this) }
    }

    /// Splice `node` in immediately before `head` (i.e. at the tail of the
    /// list `head` anchors). Used for FIFO "append to run queue tail".
    ///
    /// # Safety
    /// `node` must not already be linked into any list. Both pointers must
    /// be valid and stable.
    pub unsafe fn insert_before(node: NonNull<Link>, head: NonNull<Link>) {
        unsafe {
            let prev = (*head.as_ptr()).prev.unwrap();
            (*node.as_ptr()).prev = Some(prev);
            (*node.as_ptr()).next = Some(head);
            (*prev.as_ptr()).next = Some(node);
            (*head.as_ptr()).prev = Some(node);
        }
    }

    /// Splice `node` in immediately after `head` (at the list's front). Used
    /// for "insert at run queue head" (expired-timer preemption).
    ///
    /// # Safety
    /// Same requirements as [`Link::insert_before`].
    pub unsafe fn insert_after(node: NonNull<Link>, head: NonNull<Link>) {
        unsafe {
            let next = (*head.as_ptr()).next.unwrap();
            (*node.as_ptr()).next = Some(next);
            (*node.as_ptr()).prev = Some(head);
            (*next.as_ptr()).prev = Some(node);
            (*head.as_ptr()).next = Some(node);
        }
    }

    /// Unlink `node` from whatever list it's in, and reset it to self-linked
    /// so it's safe to re-insert or to query [`Link::is_empty`] on later.
    ///
    /// # Safety
    /// `node` must currently be linked into some list (including possibly
    /// being its own head).
    pub unsafe fn remove(node: NonNull<Link>) {
        unsafe {
            let prev = (*node.as_ptr()).prev.unwrap();
            let next = (*node.as_ptr()).next.unwrap();
            (*prev.as_ptr()).next = Some(next);
            (*next.as_ptr()).prev = Some(prev);
            (*node.as_ptr()).next = Some(node);
            (*node.as_ptr()).prev = Some(node);
        }
    }

    /// The node following `head`, or `None` if the list is empty.
    ///
    /// # Safety
    /// `head` must be a valid, initialized list head.
    pub unsafe fn front(head: NonNull<Link>) -> Option<NonNull<Link>> {
        unsafe {
            let next = (*head.as_ptr()).next.unwrap();
            if next == head { None } else { Some(next) }
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn boxed_link() -> NonNull<Link> {
        let b = Box::new(Link::new());
        let ptr = NonNull::new(Box::into_raw(b)).unwrap();
        unsafe { Link::init(ptr) };
        ptr
    }

    unsafe fn free(ptr: NonNull<Link>) {
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    #[test]
    fn empty_list_is_self_linked() {
        let head = boxed_link();
        unsafe {
            assert!(Link::is_empty(head));
            free(head);
        }
    }

    #[test]
    fn insert_before_and_remove_round_trips() {
        unsafe {
            let head = boxed_link();
            let a = boxed_link();
            let b = boxed_link();

            Link::insert_before(a, head);
            Link::insert_before(b, head);
            assert!(!Link::is_empty(head));
            assert_eq!(Link::front(head), Some(a));

            Link::remove(a);
            assert_eq!(Link::front(head), Some(b));
            Link::remove(b);
            assert!(Link::is_empty(head));

            free(head);
            free(a);
            free(b);
        }
    }

    #[test]
    fn insert_after_puts_node_at_front() {
        unsafe {
            let head = boxed_link();
            let a = boxed_link();
            let b = boxed_link();

            Link::insert_before(a, head);
            Link::insert_after(b, head);
            assert_eq!(Link::front(head), Some(b));

            Link::remove(a);
            Link::remove(b);
            free(head);
            free(a);
            free(b);
        }
    }
}
