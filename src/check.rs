//! Heap consistency verifier. [`Heap::check`] walks the address ordered
//! block sequence and the free list, cross checking the two views and
//! reporting the first violation it finds as a [`Corruption`] value. It is
//! O(heap) and meant for development and tests after every mutating call,
//! never for hot paths. No recovery is attempted: a corrupt heap stays
//! corrupt.

use std::{error::Error, fmt, ptr};

use crate::{
    freelist,
    heap::Heap,
    tag::{self, Tag, ALIGNMENT, MIN_BLOCK_SIZE, TAG_SIZE},
};

/// A structural invariant violation found by [`Heap::check`]. Addresses are
/// reported as plain integers since the blocks they point into are, by
/// definition, no longer trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The prologue header no longer encodes a minimum size allocated
    /// block.
    BadPrologue { size: usize, allocated: bool },
    /// A block pointer that is not 8 byte aligned.
    Misaligned { address: usize },
    /// A block whose size is below the minimum or not a multiple of 8.
    BadBlockSize { address: usize, size: usize },
    /// A block that extends past the top of the heap.
    BlockOutOfBounds { address: usize, size: usize },
    /// Header and footer of one block disagree.
    TagMismatch { address: usize, header: u32, footer: u32 },
    /// Two blocks that are address neighbors are both free, something
    /// coalescing should have made impossible.
    AdjacentFree { first: usize, second: usize },
    /// Forward walking the blocks did not end on the epilogue word at the
    /// top of the heap.
    LostEpilogue { address: usize },
    /// A free list node whose PREV link disagrees with the node it was
    /// reached from, or a chain that ends somewhere other than the
    /// sentinel.
    BrokenLink { node: usize },
    /// A free list link pointing outside the heap, or a null NEXT link
    /// (the chain must end at the sentinel, never at null).
    LinkOutOfBounds { node: usize, link: usize },
    /// More nodes than the heap could possibly hold: the list cycles.
    UnterminatedFreeList { nodes: usize },
    /// The block walk and the free list disagree on how many blocks are
    /// free, so some block is linked but not marked or the other way
    /// around.
    FreeListMismatch { walked: usize, linked: usize },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Corruption::BadPrologue { size, allocated } => {
                write!(f, "bad prologue header: size {size}, allocated {allocated}")
            }
            Corruption::Misaligned { address } => {
                write!(f, "block pointer {address:#x} is not {ALIGNMENT} byte aligned")
            }
            Corruption::BadBlockSize { address, size } => {
                write!(f, "block {address:#x} has impossible size {size}")
            }
            Corruption::BlockOutOfBounds { address, size } => {
                write!(f, "block {address:#x} of size {size} extends past the heap")
            }
            Corruption::TagMismatch { address, header, footer } => {
                write!(
                    f,
                    "block {address:#x}: header {header:#x} and footer {footer:#x} disagree"
                )
            }
            Corruption::AdjacentFree { first, second } => {
                write!(f, "adjacent free blocks {first:#x} and {second:#x}")
            }
            Corruption::LostEpilogue { address } => {
                write!(f, "block walk ended at {address:#x}, not at the epilogue")
            }
            Corruption::BrokenLink { node } => {
                write!(f, "free list links around node {node:#x} are inconsistent")
            }
            Corruption::LinkOutOfBounds { node, link } => {
                write!(f, "free list node {node:#x} links to {link:#x}, outside the heap")
            }
            Corruption::UnterminatedFreeList { nodes } => {
                write!(f, "free list did not terminate after {nodes} nodes")
            }
            Corruption::FreeListMismatch { walked, linked } => {
                write!(
                    f,
                    "{walked} free blocks in the heap but {linked} nodes in the free list"
                )
            }
        }
    }
}

impl Error for Corruption {}

impl Heap {
    /// Verifies every structural invariant of the heap: prologue intact,
    /// blocks aligned and boundary tagged consistently, no adjacent free
    /// blocks, the block walk ending exactly on the epilogue, free list
    /// links sound, and free list membership matching the allocation bits.
    pub fn check(&self) -> Result<(), Corruption> {
        unsafe {
            self.check_prologue()?;
            let walked = self.check_blocks()?;
            let linked = self.check_free_list()?;

            if walked != linked {
                return Err(Corruption::FreeListMismatch { walked, linked });
            }
        }

        Ok(())
    }

    unsafe fn check_prologue(&self) -> Result<(), Corruption> {
        let header = tag::read(tag::header(self.prologue));

        if header != Tag::new(MIN_BLOCK_SIZE, true) {
            return Err(Corruption::BadPrologue {
                size: header.size(),
                allocated: header.is_allocated(),
            });
        }

        Ok(())
    }

    /// Walks every block in address order, returning how many were free.
    unsafe fn check_blocks(&self) -> Result<usize, Corruption> {
        // One past the highest in-use byte.
        let end = self.segment.hi() as usize + 1;

        let mut free_count = 0;
        let mut previous = 0;
        let mut previous_free = false;

        let mut bp = self.prologue;
        loop {
            let header = tag::read(tag::header(bp));
            if header.is_end() {
                break;
            }

            let address = bp.as_ptr() as usize;

            if address % ALIGNMENT != 0 {
                return Err(Corruption::Misaligned { address });
            }

            if header.size() < MIN_BLOCK_SIZE || header.size() % ALIGNMENT != 0 {
                return Err(Corruption::BadBlockSize { address, size: header.size() });
            }

            // A corrupt size could send the walk outside the segment; bail
            // out before dereferencing anything out there. The next block's
            // header must still fit below the end.
            if address + header.size() > end {
                return Err(Corruption::BlockOutOfBounds { address, size: header.size() });
            }

            let footer = tag::read(tag::footer(bp));
            if header != footer {
                return Err(Corruption::TagMismatch {
                    address,
                    header: header.word(),
                    footer: footer.word(),
                });
            }

            let free = !header.is_allocated();
            if free && previous_free {
                return Err(Corruption::AdjacentFree { first: previous, second: address });
            }
            free_count += usize::from(free);

            previous = address;
            previous_free = free;
            bp = tag::next_block(bp);
        }

        // The walk must land exactly on the epilogue header, the last word
        // of the in-use segment.
        let epilogue = tag::header(bp) as usize;
        if epilogue != end - TAG_SIZE {
            return Err(Corruption::LostEpilogue { address: epilogue });
        }

        Ok(free_count)
    }

    /// Walks the free list up to the sentinel, returning the node count.
    /// The sentinel itself is special cased: it terminates the walk via its
    /// allocation bit and only its back link is inspected, never its tags
    /// or its NEXT link.
    unsafe fn check_free_list(&self) -> Result<usize, Corruption> {
        // Every block is at least MIN_BLOCK_SIZE, so a consistent list can
        // never have more nodes than this; more means the links cycle.
        let max_nodes = self.segment.len() / MIN_BLOCK_SIZE;

        let mut count = 0;
        let mut previous = ptr::null_mut::<u8>();
        let mut node = self.free.head();

        while !tag::read(tag::header(node)).is_allocated() {
            let address = node.as_ptr() as usize;

            if count == max_nodes {
                return Err(Corruption::UnterminatedFreeList { nodes: count });
            }

            if address % ALIGNMENT != 0 {
                return Err(Corruption::Misaligned { address });
            }

            let header = tag::read(tag::header(node));
            let footer = tag::read(tag::footer(node));
            if header != footer {
                return Err(Corruption::TagMismatch {
                    address,
                    header: header.word(),
                    footer: footer.word(),
                });
            }

            if freelist::prev_of(node) != previous {
                return Err(Corruption::BrokenLink { node: address });
            }

            let next = freelist::next_of(node);
            if next.is_null() || !self.segment.contains(next) {
                return Err(Corruption::LinkOutOfBounds { node: address, link: next as usize });
            }

            previous = node.as_ptr();
            count += 1;
            node = ptr::NonNull::new_unchecked(next);
        }

        // The chain must end at the sentinel, and the sentinel must point
        // back at the last real node.
        if node != self.prologue {
            return Err(Corruption::BrokenLink { node: node.as_ptr() as usize });
        }
        if freelist::prev_of(node) != previous {
            return Err(Corruption::BrokenLink { node: node.as_ptr() as usize });
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_heap_passes() {
        let mut heap = Heap::try_with_capacity(64 * 1024).unwrap();

        let p = heap.alloc(100).unwrap();
        heap.check().unwrap();

        unsafe { heap.free(p) };
        heap.check().unwrap();
    }

    #[test]
    fn detects_footer_corruption() {
        let mut heap = Heap::try_with_capacity(64 * 1024).unwrap();
        let p = heap.alloc(16).unwrap();

        unsafe { tag::write(tag::footer(p), Tag::new(64, true)) };

        assert!(matches!(
            heap.check(),
            Err(Corruption::TagMismatch { address, .. }) if address == p.as_ptr() as usize
        ));
    }

    #[test]
    fn detects_prologue_corruption() {
        let heap = Heap::try_with_capacity(64 * 1024).unwrap();

        unsafe { tag::write(tag::header(heap.prologue), Tag::new(MIN_BLOCK_SIZE, false)) };

        assert_eq!(
            heap.check(),
            Err(Corruption::BadPrologue { size: MIN_BLOCK_SIZE, allocated: false })
        );
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut heap = Heap::try_with_capacity(64 * 1024).unwrap();
        let _p0 = heap.alloc(16).unwrap();
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();

        // Stamp both free behind the allocator's back, skipping coalescing.
        unsafe {
            let size = tag::read(tag::header(a)).size();
            tag::stamp(a, Tag::new(size, false));
            let size = tag::read(tag::header(b)).size();
            tag::stamp(b, Tag::new(size, false));
        }

        assert_eq!(
            heap.check(),
            Err(Corruption::AdjacentFree {
                first: a.as_ptr() as usize,
                second: b.as_ptr() as usize,
            })
        );
    }

    #[test]
    fn detects_stale_membership() {
        let mut heap = Heap::try_with_capacity(64 * 1024).unwrap();
        let _p0 = heap.alloc(16).unwrap();
        let a = heap.alloc(64).unwrap();
        let _b = heap.alloc(64).unwrap();

        // A block marked free without ever being linked.
        unsafe {
            let size = tag::read(tag::header(a)).size();
            tag::stamp(a, Tag::new(size, false));
        }

        assert_eq!(
            heap.check(),
            Err(Corruption::FreeListMismatch { walked: 1, linked: 0 })
        );
    }

    #[test]
    fn detects_rewired_links() {
        let mut heap = Heap::try_with_capacity(64 * 1024).unwrap();
        let p0 = heap.alloc(16).unwrap();
        let a = heap.alloc(64).unwrap();

        unsafe {
            heap.free(a);

            // Point the freed block's NEXT at an allocated block. The chain
            // now terminates somewhere other than the sentinel.
            freelist::set_next(a, p0.as_ptr());
        }

        assert_eq!(
            heap.check(),
            Err(Corruption::BrokenLink { node: p0.as_ptr() as usize })
        );
    }
}
