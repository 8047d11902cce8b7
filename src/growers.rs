//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait allows users to easily change the underlying
//! buffer on which the allocators in [`firstfit_malloc::allocators`](crate::allocators) operate.

use super::header::HEADER_ALIGN;
use super::util::{checked_offset, find_aligned};

use core::ptr::NonNull;

use libc::{brk, sbrk};

/// A trait for types that act as if they were a contiguous buffer
/// whose end can be moved up and down.
///
/// # Safety
/// * copying, cloning, or moving the grower must not invalidate any pointers to the buffer
///   managed by the grower. This generally means that growers should not own but
///   reference their underlying buffers.
/// * the buffer end must always be [`HEADER_ALIGN`]-aligned.
///
/// [`HEADER_ALIGN`]: crate::header::HEADER_ALIGN
pub unsafe trait Grower {
    /// Moves the end of the underlying buffer by exactly `increment` bytes,
    /// growing it for positive values and shrinking it for negative ones.
    /// Returns the end of the buffer before the adjustment
    /// or `Err(())` if the adjustment failed, in which case the buffer is left untouched.
    ///
    /// # Safety
    /// Implementors should ensure that `adjust(0)` does not move the end of the buffer.
    /// Callers must only shrink memory they no longer use
    /// and only by multiples of [`HEADER_ALIGN`](crate::header::HEADER_ALIGN).
    unsafe fn adjust(&mut self, increment: isize) -> Result<NonNull<u8>, ()>;
}

#[derive(Debug, Default)]
/// A grower that internally uses [`libc::sbrk`] and [`libc::brk`] to operate
/// on the end of the process's data segment.
///
/// The heap end is read from the program break on every call and rounded up to
/// [`HEADER_ALIGN`](crate::header::HEADER_ALIGN), so a break moved by someone else
/// only costs the alignment padding of the next growth.
pub struct BrkGrower {
    _private: (),
}

impl BrkGrower {
    #[inline(always)]
    pub const fn new() -> Self {
        BrkGrower { _private: () }
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn adjust(&mut self, increment: isize) -> Result<NonNull<u8>, ()> {
        let program_break = unsafe { sbrk(0) };
        debug_assert_ne!(program_break as isize, -1, "Calling sbrk(0) should never fail.");
        if program_break as isize == -1 {
            return Err(());
        }
        let heap_end = find_aligned(program_break.cast(), HEADER_ALIGN).ok_or(())? as *mut u8;
        if increment == 0 {
            return NonNull::new(heap_end).ok_or(());
        }
        if increment < 0 && heap_end != program_break.cast() {
            // Only memory ending exactly at the break can be given back.
            return Err(());
        }
        let new_heap_end = checked_offset(heap_end, increment).ok_or(())? as *mut u8;
        if unsafe { brk(new_heap_end.cast()) } == -1 {
            return Err(());
        }
        NonNull::new(heap_end).ok_or(())
    }
}

/// A grower that operates on a fixed, caller-provided buffer.
///
/// Useful for independent heaps and for tests that need a deterministic heap boundary.
#[derive(Debug)]
pub struct ArenaGrower {
    heap_start: *mut u8,
    heap_end: *mut u8,
    arena_end: *mut u8,
}

impl ArenaGrower {
    /// Creates a grower that hands out the `size` bytes starting at `buf`.
    /// The heap starts at the first [`HEADER_ALIGN`]-aligned address of the buffer
    /// and never extends past its last aligned address.
    ///
    /// # Safety
    /// `buf` must be valid for reads and writes of `size` bytes for the lifetime of the grower
    /// and the allocators using it, and nothing else may access it in the meantime.
    ///
    /// [`HEADER_ALIGN`]: crate::header::HEADER_ALIGN
    pub unsafe fn new(buf: *mut u8, size: usize) -> Self {
        let buf_end = buf.wrapping_add(size);
        let heap_start = find_aligned(buf, HEADER_ALIGN)
            .map_or(buf_end, |p| p as *mut u8)
            .min(buf_end);
        let usable = (buf_end as usize - heap_start as usize) / HEADER_ALIGN * HEADER_ALIGN;
        ArenaGrower {
            heap_start,
            heap_end: heap_start,
            arena_end: heap_start.wrapping_add(usable),
        }
    }

    /// Returns the lowest address of the heap.
    #[inline]
    pub fn heap_start(&self) -> *mut u8 {
        self.heap_start
    }

    /// Returns the number of bytes the heap can still grow by.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.arena_end as usize - self.heap_end as usize
    }
}

unsafe impl Grower for ArenaGrower {
    unsafe fn adjust(&mut self, increment: isize) -> Result<NonNull<u8>, ()> {
        let heap_end = self.heap_end;
        let new_heap_end = checked_offset(heap_end, increment).ok_or(())? as *mut u8;
        if new_heap_end > self.arena_end || new_heap_end < self.heap_start {
            return Err(());
        }
        self.heap_end = new_heap_end;
        NonNull::new(heap_end).ok_or(())
    }
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn adjust(&mut self, increment: isize) -> Result<NonNull<u8>, ()> {
        (**self).adjust(increment)
    }
}
