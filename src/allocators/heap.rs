//! A multithreaded memory allocator.

use crate::allocators::raw_heap::{HeapStats, RawHeap};
use crate::growers::{BrkGrower, Grower};
use crate::header::HEADER_ALIGN;

use crate::util::find_aligned;

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{copy_nonoverlapping, null_mut, NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A multithreaded memory allocator.
///
/// This allocator is just a `Mutex` wrapper over [`RawHeap`] to allow for multithreading.
/// Every operation holds the lock from start to finish, so all calls on a heap
/// happen in a single total order.
pub struct Heap<T: Grower> {
    inner: Mutex<RawHeap<T>>,
}

impl<T: Grower> Heap<T> {
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying buffer for the lifetime of the returned allocator.
    pub const unsafe fn with_grower(grower: T) -> Self {
        Heap {
            inner: Mutex::new(RawHeap::with_grower(grower)),
        }
    }

    /// See [`RawHeap::allocate`].
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.lock().allocate(size)
    }

    /// See [`RawHeap::release`].
    ///
    /// # Safety
    /// The payload must not be used after this call.
    pub unsafe fn release(&self, ptr: *mut u8) {
        self.lock().release(ptr)
    }

    /// See [`RawHeap::zero_allocate`].
    pub fn zero_allocate(&self, count: usize, element_size: usize) -> *mut u8 {
        self.lock().zero_allocate(count, element_size)
    }

    /// See [`RawHeap::resize`].
    ///
    /// # Safety
    /// If a pointer other than `ptr` is returned, `ptr` must not be used anymore.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.lock().resize(ptr, new_size)
    }

    /// Returns the current end of the heap.
    pub fn heap_end(&self) -> Option<NonNull<u8>> {
        self.lock().heap_end()
    }

    /// Returns aggregate figures about the blocks of the heap.
    pub fn stats(&self) -> HeapStats {
        self.lock().stats()
    }

    /// Consumes the heap and returns the single threaded allocator it wraps.
    pub fn into_inner(self) -> RawHeap<T> {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    // No allocator code panics while holding the lock, a poisoned lock still guards a consistent heap.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, RawHeap<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Heap<BrkGrower> {
    /// Creates a heap at the end of the process's data segment.
    ///
    /// # Safety
    /// Nothing else in the process may move the program break
    /// for the lifetime of the returned allocator.
    pub const unsafe fn new() -> Self {
        Heap::with_grower(BrkGrower::new())
    }
}

unsafe impl<T: Grower> Sync for Heap<T> {}

//---------------impl GlobalAlloc for Heap---------------//

// Layouts aligned above `HEADER_ALIGN` get a block of `size + align` bytes. The object starts
// at the first `align`-aligned address past the payload start and the payload pointer is kept
// in the word right before the object.

/// Returns where the payload pointer of the over-aligned object at `obj_start` is kept.
#[inline(always)]
fn payload_slot(obj_start: *mut u8) -> *mut *mut u8 {
    obj_start.wrapping_sub(size_of::<*mut u8>()).cast()
}

impl<T: Grower> Heap<T> {
    unsafe fn alloc_over_aligned(&self, layout: Layout) -> *mut u8 {
        let Some(padded_size) = layout.size().checked_add(layout.align()) else {
            return null_mut();
        };
        let payload = self.allocate(padded_size);
        if payload.is_null() {
            return null_mut();
        }
        // The payload is `HEADER_ALIGN`-aligned, so the gap before the object is at least
        // `HEADER_ALIGN` bytes and the object still ends inside the payload.
        let Some(obj_start) = find_aligned(payload.wrapping_add(1), layout.align()) else {
            self.release(payload);
            return null_mut();
        };
        let obj_start = obj_start as *mut u8;
        payload_slot(obj_start).write(payload);
        obj_start
    }

    /// Returns the payload pointer that backs the object at `ptr`.
    #[inline]
    unsafe fn payload_of(ptr: *mut u8, layout: Layout) -> *mut u8 {
        match layout.align() > HEADER_ALIGN {
            true => payload_slot(ptr).read(),
            false => ptr,
        }
    }
}

unsafe impl<T: Grower> GlobalAlloc for Heap<T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEADER_ALIGN {
            return self.alloc_over_aligned(layout);
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.release(Self::payload_of(ptr, layout))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEADER_ALIGN {
            let ptr = self.alloc_over_aligned(layout);
            if !ptr.is_null() {
                ptr.write_bytes(0, layout.size());
            }
            return ptr;
        }
        self.zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEADER_ALIGN {
            return self.resize(ptr, new_size);
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc_over_aligned(new_layout);
        if !new_ptr.is_null() {
            copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}
