//! Explicit free list. Free blocks are woven into a doubly linked list by
//! storing two raw pointers in the first bytes of their payload, space that
//! nobody else is using while the block is free:
//!
//! ```text
//!           +--------------------------+
//! bp - 4    | HEADER (size, free)      |
//!           +--------------------------+
//! bp        | PREV free block          | <--+
//!           +--------------------------+    | links, only while free
//! bp + 8    | NEXT free block          | <--+
//!           +--------------------------+
//!           | rest of payload          |
//!           +--------------------------+
//!           | FOOTER (size, free)      |
//!           +--------------------------+
//! ```
//!
//! [`MIN_BLOCK_SIZE`](crate::tag::MIN_BLOCK_SIZE) exists precisely so these
//! two links always fit. The links may point at blocks anywhere in the heap;
//! insertion order is LIFO (push front), which is what gives the allocator
//! its freed-then-reallocated address reuse.
//!
//! # The sentinel
//!
//! The list is rooted at the payload of the *prologue* block: a minimum
//! size, permanently allocated block at the very bottom of the heap whose
//! payload holds nothing but a pair of links. It is the one exception to
//! "a block is linked iff it is free" - the sentinel is allocated yet sits
//! at the tail of the list forever. Traversal therefore terminates on the
//! allocation bit of the current node, not on a null pointer, and the
//! sentinel itself is never yielded.

use std::{mem, ptr::NonNull};

use crate::tag;

/// Byte offset of the NEXT link inside a free payload; PREV occupies the
/// first pointer slot.
const NEXT_OFFSET: usize = mem::size_of::<*mut u8>();

/// Reads the PREV link of the free block at `bp`. Null means `bp` is the
/// head of the list.
///
/// # Safety
///
/// `bp` must be a linked free block or the sentinel.
#[inline]
pub(crate) unsafe fn prev_of(bp: NonNull<u8>) -> *mut u8 {
    bp.as_ptr().cast::<*mut u8>().read()
}

/// Reads the NEXT link of the free block at `bp`. Same contract as
/// [`prev_of`].
#[inline]
pub(crate) unsafe fn next_of(bp: NonNull<u8>) -> *mut u8 {
    bp.as_ptr().add(NEXT_OFFSET).cast::<*mut u8>().read()
}

#[inline]
pub(crate) unsafe fn set_prev(bp: NonNull<u8>, prev: *mut u8) {
    bp.as_ptr().cast::<*mut u8>().write(prev)
}

#[inline]
pub(crate) unsafe fn set_next(bp: NonNull<u8>, next: *mut u8) {
    bp.as_ptr().add(NEXT_OFFSET).cast::<*mut u8>().write(next)
}

/// The free list itself: just the head pointer. The links live inside the
/// heap, so there is nothing else to own.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: NonNull<u8>,
}

impl FreeList {
    /// Creates a list whose tail is the given sentinel. The caller has
    /// already stamped the sentinel allocated and zeroed its links.
    pub fn new(sentinel: NonNull<u8>) -> Self {
        Self { head: sentinel }
    }

    pub fn head(&self) -> NonNull<u8> {
        self.head
    }

    /// Splices `bp` in front of the current head.
    ///
    /// # Safety
    ///
    /// `bp` must be a free block that is not currently linked.
    pub unsafe fn push_front(&mut self, bp: NonNull<u8>) {
        set_next(bp, self.head.as_ptr());
        set_prev(self.head, bp.as_ptr());
        set_prev(bp, std::ptr::null_mut());
        self.head = bp;
    }

    /// Unlinks `bp` by rewiring its neighbors' cross links. The NEXT side
    /// always exists (a real free block or the sentinel); only the PREV
    /// side needs the head special case.
    ///
    /// # Safety
    ///
    /// `bp` must be a linked free block.
    pub unsafe fn unlink(&mut self, bp: NonNull<u8>) {
        let prev = prev_of(bp);
        let next = next_of(bp);

        if prev.is_null() {
            self.head = NonNull::new_unchecked(next);
        } else {
            set_next(NonNull::new_unchecked(prev), next);
        }

        set_prev(NonNull::new_unchecked(next), prev);
    }

    /// Lazy first-to-last traversal of the free blocks. Stops at the
    /// sentinel without yielding it.
    ///
    /// # Safety
    ///
    /// The list must be consistent for the lifetime of the iterator; no
    /// heap mutation while it is alive.
    pub unsafe fn iter(&self) -> Iter {
        Iter { current: self.head }
    }
}

pub(crate) struct Iter {
    current: NonNull<u8>,
}

impl Iterator for Iter {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        unsafe {
            if tag::read(tag::header(self.current)).is_allocated() {
                return None;
            }

            let bp = self.current;
            self.current = NonNull::new_unchecked(next_of(bp));
            Some(bp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Tag, MIN_BLOCK_SIZE, TAG_OVERHEAD};

    #[repr(align(8))]
    struct Arena([u8; 160]);

    /// Lays out a sentinel and two free blocks the way bootstrap and
    /// extension would, returning their payload pointers.
    unsafe fn build(arena: &mut Arena) -> (NonNull<u8>, NonNull<u8>, NonNull<u8>) {
        let base = arena.0.as_mut_ptr();

        let sentinel = NonNull::new_unchecked(base.add(TAG_OVERHEAD));
        tag::stamp(sentinel, Tag::new(MIN_BLOCK_SIZE, true));
        set_prev(sentinel, std::ptr::null_mut());
        set_next(sentinel, std::ptr::null_mut());

        let first = tag::next_block(sentinel);
        tag::stamp(first, Tag::new(40, false));

        let second = tag::next_block(first);
        tag::stamp(second, Tag::new(48, false));

        (sentinel, first, second)
    }

    #[test]
    fn push_and_iterate() {
        let mut arena = Arena([0; 160]);

        unsafe {
            let (sentinel, first, second) = build(&mut arena);
            let mut list = FreeList::new(sentinel);

            assert_eq!(list.iter().count(), 0);

            list.push_front(first);
            list.push_front(second);

            // LIFO order: the most recently pushed block leads.
            let order: Vec<_> = list.iter().collect();
            assert_eq!(order, vec![second, first]);

            // Cross links are consistent all the way to the sentinel.
            assert_eq!(next_of(second), first.as_ptr());
            assert_eq!(prev_of(first), second.as_ptr());
            assert_eq!(next_of(first), sentinel.as_ptr());
            assert_eq!(prev_of(sentinel), first.as_ptr());
            assert!(prev_of(second).is_null());
        }
    }

    #[test]
    fn unlink_head_middle_and_tail() {
        let mut arena = Arena([0; 160]);

        unsafe {
            let (sentinel, first, second) = build(&mut arena);
            let mut list = FreeList::new(sentinel);
            list.push_front(first);
            list.push_front(second);

            // Unlinking the head moves the root forward.
            list.unlink(second);
            assert_eq!(list.head(), first);
            assert_eq!(list.iter().count(), 1);
            assert!(prev_of(first).is_null());

            // Unlinking the last real block leaves the empty sentinel list.
            list.unlink(first);
            assert_eq!(list.head(), sentinel);
            assert_eq!(list.iter().count(), 0);

            // Relink and remove from the middle.
            list.push_front(first);
            list.push_front(second);
            list.unlink(first);
            assert_eq!(next_of(second), sentinel.as_ptr());
            assert_eq!(prev_of(sentinel), second.as_ptr());
        }
    }
}
