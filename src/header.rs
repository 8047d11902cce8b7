//! Defines the [`Header`] struct and associated constants and functions.

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::util::find_divisible;

pub const HEADER_SIZE: usize = size_of::<Header>();
pub const HEADER_ALIGN: usize = align_of::<Header>();

// Payloads directly follow headers, so every payload inherits the header alignment.
const_assert!(HEADER_ALIGN >= align_of::<libc::max_align_t>());
const_assert!(HEADER_SIZE % HEADER_ALIGN == 0);

/// The record that precedes every block on the heap.
///
/// `size` is the payload size that was requested when the block was created.
/// It never changes afterwards, reusing a block for a smaller request leaves it as is.
/// The block list is threaded through the `next` fields in ascending address order.
#[derive(Debug, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Header {
    pub size: usize,
    pub is_free: bool,
    pub next: *mut Header,
}

impl Header {
    /// Creates the header of a freshly carved out, occupied block.
    #[inline(always)]
    pub const fn new(size: usize) -> Header {
        Header {
            size,
            is_free: false,
            next: null_mut(),
        }
    }

    /// Returns the number of heap bytes taken by this block, header included.
    #[inline(always)]
    pub fn footprint(&self) -> usize {
        // Blocks are only created for sizes whose footprint was computed successfully.
        HEADER_SIZE + self.size.next_multiple_of(HEADER_ALIGN)
    }

    /// Returns a pointer to the payload of the block described by `header`.
    #[inline(always)]
    pub fn payload(header: NonNull<Header>) -> NonNull<u8> {
        // SAFETY: a header is never the last byte of the address space.
        unsafe { NonNull::new_unchecked(header.as_ptr().wrapping_add(1).cast()) }
    }
}

/// Returns the number of heap bytes a block with a `size`-byte payload takes,
/// or `None` if that number can not be handed to a grower.
///
/// The payload is padded so that the next header stays [`HEADER_ALIGN`]-aligned.
#[inline]
pub fn footprint_for(size: usize) -> Option<usize> {
    let footprint = find_divisible(size, HEADER_ALIGN)?.checked_add(HEADER_SIZE)?;
    (footprint <= isize::MAX as usize).then_some(footprint)
}
