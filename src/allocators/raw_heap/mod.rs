//! A singlethreaded memory allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Footprints
// A header records the payload size exactly as requested, but the block takes
// `HEADER_SIZE + size` rounded up to `HEADER_ALIGN` bytes of heap (its footprint)
// so that the next header stays aligned. Every heap growth and shrink moves the
// boundary by exactly one footprint, which is what lets `release` recognise the
// topmost block by comparing the footprint end with the heap end.
//
// ## Trailing free blocks
// When releasing the topmost block uncovers a free block that now ends at the heap end,
// that block is returned to the grower as well. With an exclusively owned grower the tail
// of the block list is therefore never free.

use crate::block_list::BlockList;
use crate::growers::Grower;
use crate::header::{footprint_for, Header, HEADER_ALIGN};
use crate::util::raw_ptr;

use core::fmt::Debug;
use core::ptr::{copy_nonoverlapping, write_bytes, NonNull};

use tracing::{debug, error, instrument, warn, Level};

/// A snapshot of a single block, as returned by [`RawHeap::blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub payload: NonNull<u8>,
    pub size: usize,
    pub is_free: bool,
}

/// Aggregate figures about the blocks of a heap.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of blocks in the block list.
    pub blocks: usize,
    /// Number of blocks available for reuse.
    pub free_blocks: usize,
    /// Sum of the recorded sizes of free blocks.
    pub free_bytes: usize,
    /// Sum of the recorded sizes of occupied blocks.
    pub used_bytes: usize,
}

/// A single threaded memory allocator.
pub struct RawHeap<T: Grower> {
    blocks: BlockList,
    grower: T,
}

impl<T: Grower> Debug for RawHeap<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawHeap")
            .field("head", &self.blocks.head())
            .field("tail", &self.blocks.tail())
            .finish()
    }
}

impl<T: Grower> RawHeap<T> {
    /// Creates an allocator instance with the specified grower.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying buffer for the lifetime of the returned allocator.
    pub const unsafe fn with_grower(grower: T) -> Self {
        RawHeap {
            blocks: BlockList::new(),
            grower,
        }
    }

    /// Allocates a block with a payload of at least `size` bytes
    /// and returns a pointer to the payload.
    ///
    /// Free blocks are searched in address order and the first one that is large enough
    /// is reused as a whole. If there is none the heap grows by a new block.
    /// Returns null if `size` is 0 or if the heap could not grow.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        raw_ptr(self.__allocate(size).ok())
    }

    /// Releases the block whose payload starts at `ptr`. Releasing null is a no-op.
    ///
    /// The topmost block is returned to the grower, any other block is marked free for reuse.
    /// Pointers that are not the payload of an occupied block of this heap
    /// (including pointers that were already released) are logged and ignored.
    ///
    /// # Safety
    /// The payload must not be used after this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Ok(header) = self.live_block(ptr) {
            self.release_block(header);
        }
    }

    /// Allocates a zero-filled payload for `count` elements of `element_size` bytes each.
    /// Returns null if either argument is 0, if `count * element_size` overflows
    /// or if the allocation failed.
    pub fn zero_allocate(&mut self, count: usize, element_size: usize) -> *mut u8 {
        if count == 0 || element_size == 0 {
            return core::ptr::null_mut();
        }
        let Some(size) = count.checked_mul(element_size) else {
            warn!(count, element_size, "Zero-allocation size overflows.");
            return core::ptr::null_mut();
        };
        let ptr = self.allocate(size);
        if !ptr.is_null() {
            unsafe { write_bytes(ptr, 0, size) };
        }
        ptr
    }

    /// Resizes the allocation at `ptr` so that it can hold `new_size` bytes.
    ///
    /// A null `ptr` or a zero `new_size` behaves exactly like [`allocate(new_size)`](Self::allocate),
    /// so `resize(ptr, 0)` returns null and leaves `ptr` allocated.
    /// If the block already holds `new_size` bytes `ptr` itself is returned.
    /// Otherwise the payload moves to a new block and the old one is released.
    /// On failure null is returned and the original allocation stays valid.
    ///
    /// # Safety
    /// If a pointer other than `ptr` is returned, `ptr` must not be used anymore.
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        match NonNull::new(ptr) {
            Some(ptr) if new_size != 0 => raw_ptr(self.__resize(ptr, new_size).ok()),
            _ => self.allocate(new_size),
        }
    }

    /// Returns the current end of the heap.
    pub fn heap_end(&mut self) -> Option<NonNull<u8>> {
        unsafe { self.grower.adjust(0).ok() }
    }

    /// Returns an iterator over all blocks of the heap in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().map(|h| {
            let header = unsafe { h.as_ref() };
            BlockInfo {
                payload: Header::payload(h),
                size: header.size,
                is_free: header.is_free,
            }
        })
    }

    /// Returns aggregate figures about the blocks of the heap.
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(HeapStats::default(), |mut stats, block| {
            stats.blocks += 1;
            match block.is_free {
                true => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                }
                false => stats.used_bytes += block.size,
            }
            stats
        })
    }

    /// Returns a shared reference to the underlying grower.
    pub fn grower(&self) -> &T {
        &self.grower
    }
}

impl<T: Grower> RawHeap<T> {
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn __allocate(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        debug_assert_ne!(size, 0);
        if let Some(header) = self.blocks.first_fit(size) {
            unsafe { (*header.as_ptr()).is_free = false };
            debug!(?header, capacity = unsafe { header.as_ref().size }, "Reusing free block.");
            return Ok(Header::payload(header));
        }
        debug!("Couldn't find free block to accomodate object, requesting heap growth.");
        let header = self.grow(size)?;
        unsafe { self.blocks.push_back(header) };
        Ok(Header::payload(header))
    }

    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn __resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, ()> {
        let header = self.live_block(ptr)?;
        let old_size = header.as_ref().size;
        if old_size >= new_size {
            debug!(old_size, "Block is large enough, keeping it.");
            return Ok(ptr);
        }

        let new_ptr = self.__allocate(new_size)?;
        copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        self.release_block(header);
        Ok(new_ptr)
    }

    /// Grows the heap by the footprint of a block with a `size`-byte payload
    /// and writes an occupied header at the start of the new memory.
    /// Returns the new header or `Err(())` if the heap can not grow.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn grow(&mut self, size: usize) -> Result<NonNull<Header>, ()> {
        let Some(footprint) = footprint_for(size) else {
            error!("Growth failure, object is too big.");
            return Err(());
        };
        debug!(footprint, "Calculated growth amount.");

        let old_heap_end = unsafe { self.grower.adjust(footprint as isize) }
            .inspect_err(|_| error!("Growth failure, no memory."))?;
        debug_assert_eq!(old_heap_end.as_ptr() as usize % HEADER_ALIGN, 0);

        let header = old_heap_end.cast::<Header>();
        unsafe { header.as_ptr().write(Header::new(size)) };
        Ok(header)
    }

    /// Releases an occupied block that is known to be in the block list.
    #[instrument(level = "debug")]
    unsafe fn release_block(&mut self, header: NonNull<Header>) {
        debug_assert!(!header.as_ref().is_free);
        let topmost = self.is_topmost(header);
        debug_assert!(!topmost || self.blocks.tail() == Some(header));
        if topmost && self.shrink().is_ok() {
            // Blocks freed while they were not topmost might be topmost now.
            while let Some(tail) = self.blocks.tail() {
                if !tail.as_ref().is_free || !self.is_topmost(tail) || self.shrink().is_err() {
                    break;
                }
            }
            return;
        }
        (*header.as_ptr()).is_free = true;
        debug!(?header, "Marked block as free.");
    }

    /// Unlinks the tail block and returns its footprint to the grower.
    /// On failure the block list is left untouched.
    #[instrument(level = "debug", err(Debug, level = Level::ERROR))]
    unsafe fn shrink(&mut self) -> Result<(), ()> {
        let tail = self.blocks.tail().ok_or(())?;
        let footprint = tail.as_ref().footprint();
        self.grower
            .adjust(-(footprint as isize))
            .inspect_err(|_| error!(?tail, "Shrink failure, grower refused to give memory back."))?;
        let popped = self.blocks.pop_back();
        debug_assert_eq!(popped, Some(tail));
        debug!(?tail, footprint, "Returned topmost block to the grower.");
        Ok(())
    }

    /// Returns whether the block ends exactly at the heap end.
    unsafe fn is_topmost(&mut self, header: NonNull<Header>) -> bool {
        let block_end = header.as_ptr().cast::<u8>().wrapping_add(header.as_ref().footprint());
        self.heap_end().is_some_and(|end| end.as_ptr() == block_end)
    }

    /// Recovers the header of the occupied block whose payload starts at `ptr`.
    /// Returns `Err(())` if no such block exists.
    fn live_block(&self, ptr: NonNull<u8>) -> Result<NonNull<Header>, ()> {
        let Some(header) = self.blocks.find_by_payload(ptr) else {
            warn!(?ptr, "Pointer is not owned by this heap, ignoring it.");
            return Err(());
        };
        if unsafe { header.as_ref().is_free } {
            warn!(?ptr, "Pointer was already released, ignoring it.");
            return Err(());
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests;
