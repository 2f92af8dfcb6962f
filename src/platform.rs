//! Where heap segments come from. Every target provides one `sys` module
//! with the same three entry points, selected by `cfg`; the rest of the
//! crate goes through the thin wrappers below and never sees an OS type.
//! Reservations are large and long lived (one per heap), so there is no
//! grow or commit machinery here, just whole-span reserve and release.

use std::{ptr::NonNull, sync::OnceLock};

use crate::Pointer;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Virtual memory page size, asked of the OS once and cached.
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { sys::page_size() })
}

/// Reserves a readable and writable span of `length` bytes, or `None` if
/// the OS refuses. The returned address is page aligned.
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    sys::reserve(length)
}

/// Hands the span at `address` back to the OS. `length` must be the value
/// it was reserved with.
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    sys::release(address, length)
}

#[cfg(all(unix, not(miri)))]
mod sys {
    use std::ptr::{self, NonNull};

    use crate::Pointer;

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // MAP_NORESERVE keeps swap accounting out of the picture: a heap
        // reserves its whole capacity up front but typically touches only
        // the first pages of it.
        let address = libc::mmap(
            ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );

        if address == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(address.cast())
    }

    pub unsafe fn release(address: NonNull<u8>, length: usize) {
        // If munmap fails the span simply stays mapped; no caller could do
        // anything useful with that outcome.
        libc::munmap(address.as_ptr().cast(), length);
    }

    pub unsafe fn page_size() -> usize {
        libc::sysconf(libc::_SC_PAGE_SIZE) as usize
    }
}

#[cfg(all(windows, not(miri)))]
mod sys {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::Pointer;

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // Reserve and commit in a single call. Committed pages cost no
        // physical memory until first touch, so this stays cheap even for
        // large spans.
        let address = Memory::VirtualAlloc(
            None,
            length,
            Memory::MEM_RESERVE | Memory::MEM_COMMIT,
            Memory::PAGE_READWRITE,
        );

        NonNull::new(address.cast())
    }

    pub unsafe fn release(address: NonNull<u8>, _length: usize) {
        // MEM_RELEASE takes the whole reservation down and requires a zero
        // length; the span's extent is known from the reservation itself.
        let _ = Memory::VirtualFree(address.as_ptr().cast(), 0, Memory::MEM_RELEASE);
    }

    pub unsafe fn page_size() -> usize {
        let mut info = MaybeUninit::uninit();
        SystemInformation::GetSystemInfo(info.as_mut_ptr());

        info.assume_init().dwPageSize as usize
    }
}

#[cfg(miri)]
mod sys {
    //! Miri has no FFI, so heap segments come from the global allocator
    //! instead. As a bonus, Miri will flag any segment this crate fails to
    //! release.

    use std::{alloc, ptr::NonNull};

    use super::page_size;
    use crate::Pointer;

    fn layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        NonNull::new(alloc::alloc(layout(length)))
    }

    pub unsafe fn release(address: NonNull<u8>, length: usize) {
        alloc::dealloc(address.as_ptr(), layout(length));
    }

    pub unsafe fn page_size() -> usize {
        4096
    }
}
