//! The public, thread safe allocator. [`Tagalloc`] owns one [`Heap`]
//! behind a [`Mutex`] and bootstraps it lazily on first use, which is what
//! lets it be constructed in a `const` context and installed as the global
//! allocator. The heap core needs mutable borrows to operate and is not
//! thread safe on its own, so every public entry point goes through the
//! lock.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{check::Corruption, heap::Heap, tag, AllocError};

/// Thread safe boundary tag allocator.
///
/// # Examples
///
/// ## Standalone
///
/// ```rust
/// use tagalloc::Tagalloc;
///
/// let allocator = Tagalloc::new();
///
/// let address = allocator.allocate(64).unwrap();
/// assert_eq!(address.as_ptr() as usize % 8, 0);
///
/// unsafe { allocator.deallocate(address) };
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use tagalloc::Tagalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Tagalloc = Tagalloc::new();
///
/// fn main() {
///     let brie = String::from("brie");
///     assert_eq!(brie.len(), 4);
/// }
/// ```
pub struct Tagalloc {
    /// `None` until the first allocation reserves the segment. Lock then
    /// check, never the other way around.
    heap: Mutex<Option<Heap>>,
    /// Capacity the heap will be created with, in bytes.
    capacity: usize,
}

impl Tagalloc {
    /// Heap capacity used by [`Tagalloc::new`].
    pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

    pub const fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Caps the heap at `capacity` bytes, metadata included. Nothing is
    /// reserved until the first allocation.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(None),
            capacity,
        }
    }

    /// Locks the heap, bootstrapping it first if this is the earliest use.
    fn with_heap<T>(&self, operation: impl FnOnce(&mut Heap) -> T) -> Result<T, AllocError> {
        let mut guard = self.heap.lock().map_err(|_| AllocError)?;

        let heap = match guard.as_mut() {
            Some(heap) => heap,
            None => guard.insert(Heap::try_with_capacity(self.capacity)?),
        };

        Ok(operation(heap))
    }

    /// Allocates `size` bytes, 8 byte aligned.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_heap(|heap| heap.alloc(size))?.ok_or(AllocError)
    }

    /// Returns `address` to the heap.
    ///
    /// # Safety
    ///
    /// `address` must come from [`allocate`](Tagalloc::allocate) or
    /// [`reallocate`](Tagalloc::reallocate) on this allocator and not have
    /// been freed since.
    pub unsafe fn deallocate(&self, address: NonNull<u8>) {
        if let Ok(mut guard) = self.heap.lock() {
            if let Some(heap) = guard.as_mut() {
                heap.free(address);
            }
        }
    }

    /// Resizes an allocation, with the usual C `realloc` edge cases: a
    /// `None` address allocates, a zero `size` deallocates and returns
    /// `None`.
    ///
    /// # Safety
    ///
    /// A `Some` address must satisfy the [`deallocate`](Tagalloc::deallocate)
    /// contract.
    pub unsafe fn reallocate(
        &self,
        address: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.with_heap(|heap| unsafe { heap.realloc(address, size) })
            .ok()
            .flatten()
    }

    /// Runs the heap verifier. An allocator that has never been used has
    /// nothing to check. A poisoned lock is deliberately bypassed: a thread
    /// that died mid-allocation is exactly when checking is interesting.
    pub fn check(&self) -> Result<(), Corruption> {
        let guard = match self.heap.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.as_ref() {
            Some(heap) => heap.check(),
            None => Ok(()),
        }
    }
}

impl Default for Tagalloc {
    fn default() -> Self {
        Self::new()
    }
}

/// The inner heap is full of raw pointers into the segment, but the mutex
/// serializes every touch of them.
unsafe impl Sync for Tagalloc {}

unsafe impl GlobalAlloc for Tagalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Alignment coarser than the block granularity is not supported;
        // the contract allows signalling that with a null pointer.
        if layout.align() > tag::ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(address) => address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(address) = NonNull::new(ptr) {
            self.deallocate(address);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > tag::ALIGNMENT {
            return ptr::null_mut();
        }

        match self.reallocate(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
