//! Defines the [`BlockList`] struct, the record of every block carved out of the heap.

use core::marker::PhantomData;
use core::ptr::{null_mut, NonNull};

use crate::header::{Header, HEADER_ALIGN};

/// A singly-linked list of block headers in ascending address order.
///
/// Headers are appended at the tail only, and only the tail is ever unlinked.
#[derive(Debug)]
pub struct BlockList {
    head: *mut Header,
    tail: *mut Header,
}

impl BlockList {
    /// Creates an empty list.
    #[inline]
    pub const fn new() -> Self {
        BlockList {
            head: null_mut(),
            tail: null_mut(),
        }
    }

    /// Returns the first header or `None` if the list is empty.
    #[inline]
    pub fn head(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.head)
    }

    /// Returns the last header or `None` if the list is empty.
    #[inline]
    pub fn tail(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.tail)
    }

    /// Appends `header` to the end of the list.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `header` must point to a valid header placed after every header already in the list,
    /// and it must stay valid for as long as it is linked.
    pub unsafe fn push_back(&mut self, header: NonNull<Header>) {
        let header = header.as_ptr();
        debug_assert!(self.tail.is_null() || self.tail < header);
        (*header).next = null_mut();
        match self.tail.is_null() {
            true => self.head = header,
            false => (*self.tail).next = header,
        }
        self.tail = header;
    }

    /// Unlinks and returns the last header, or `None` if the list is empty.
    /// The predecessor is found by walking from the head,
    /// so this operation has a time complexity of *O*(n).
    pub fn pop_back(&mut self) -> Option<NonNull<Header>> {
        let tail = self.tail()?;
        if self.head == self.tail {
            self.head = null_mut();
            self.tail = null_mut();
            return Some(tail);
        }
        let prev = self
            .iter()
            .find(|h| unsafe { (*h.as_ptr()).next } == tail.as_ptr())?;
        unsafe { (*prev.as_ptr()).next = null_mut() };
        self.tail = prev.as_ptr();
        Some(tail)
    }

    /// Returns the first free header whose size is at least `size`.
    pub fn first_fit(&self, size: usize) -> Option<NonNull<Header>> {
        self.iter().find(|h| {
            let header = unsafe { h.as_ref() };
            header.is_free && header.size >= size
        })
    }

    /// Returns the header whose payload starts at `payload`,
    /// or `None` if no block in the list owns that address.
    pub fn find_by_payload(&self, payload: NonNull<u8>) -> Option<NonNull<Header>> {
        if payload.as_ptr() as usize % HEADER_ALIGN != 0 {
            return None;
        }
        self.iter().find(|&h| Header::payload(h) == payload)
    }

    /// Returns an iterator over the headers in address order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList::new()
    }
}

/// Iterator over the headers of a [`BlockList`].
pub struct Iter<'a> {
    next: *mut Header,
    _list: PhantomData<&'a BlockList>,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = NonNull::new(self.next)?;
        // Every linked header is valid, see `push_back`.
        self.next = unsafe { (*current.as_ptr()).next };
        Some(current)
    }
}
