//! A first-fit memory allocator on top of the process's data segment.
//!
//! The crate provides the four classic allocation primitives -
//! allocate, release, zero-allocate and resize - over a single contiguous heap
//! that grows and shrinks at its top, and a mutex-guarded variant that is safe to share between threads.
//!
//! # Usage
//! ```
//! use firstfit_malloc::Heap;
//! use firstfit_malloc::growers::BrkGrower;
//!
//! #[global_allocator]
//! static ALLOCATOR: Heap<BrkGrower> = unsafe { Heap::new() };
//!
//! fn main() {
//!     let v1: Vec<u32> = vec![1, 2, 3];
//!     println!("Brk is cool {:?}", v1);
//! }
//! ```
//!
//! Heaps are plain values, so independent heaps can live side by side:
//! ```
//! use firstfit_malloc::RawHeap;
//! use firstfit_malloc::growers::ArenaGrower;
//!
//! let mut buf = vec![0_u8; 4096];
//! let mut heap = unsafe { RawHeap::with_grower(ArenaGrower::new(buf.as_mut_ptr(), buf.len())) };
//! let p = heap.zero_allocate(4, 8);
//! assert!(!p.is_null());
//! unsafe { heap.release(p) };
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`RawHeap`] and [`Heap`].
//! [`RawHeap`] is single-threaded and works through `&mut self`,
//! [`Heap`] wraps it in a `Mutex` and implements [`GlobalAlloc`].
//! Each operation on a [`Heap`] holds the lock for its whole duration.
//!
//! # Mode of operation
//! - Every block starts with a [header](#headers). All headers ever created form the
//!   [block list](#block-list), ordered by address.
//! - An allocation walks the block list and takes the first free block that is large enough.
//!   The block is reused as a whole, it is never split.
//! - If there is no such block the [grower](#growers) moves the heap end up by exactly
//!   one block and the new block is appended to the block list.
//! - Releasing the topmost block moves the heap end back down; any free blocks uncovered
//!   by that are given back too. Releasing any other block only marks it free.
//!   Adjacent free blocks are never merged.
//!
//! ## Headers
//! A header records the requested payload size, whether the block is free, and the
//! next header in the list. Headers are aligned for any primitive type and so are
//! payloads, which directly follow them. Payloads are padded so that the next header
//! stays aligned.
//!
//! ## Block list
//! A singly-linked list threaded through the headers. New blocks are only added at the tail
//! and only the tail is ever removed, so list order always matches address order.
//!
//! Pointers handed to `release` and `resize` are looked up in the block list before use.
//! Pointers the heap does not own, and pointers that were already released, are logged
//! and ignored. Passing such pointers is still a bug in the caller.
//!
//! ## Growers
//! A grower is the allocators' underlying buffer, anything implementing [`Grower`]
//! (a contiguous buffer whose end can move) can back a heap.
//! [`BrkGrower`] uses the program break, [`ArenaGrower`] a caller-provided buffer.
//!
//! # Logging
//! Operations emit [`tracing`] events and spans. The crate never installs a subscriber.
//! Do not install a subscriber that allocates while a [`Heap`] is the global allocator,
//! since it would be re-entered while its lock is held.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc
//! [`Grower`]: growers::Grower
//! [`BrkGrower`]: growers::BrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower

pub use crate::allocators::Heap;
pub use crate::allocators::RawHeap;

pub mod allocators;
mod block_list;
pub mod growers;
pub mod header;
mod util;
