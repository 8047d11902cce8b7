//! The [`RawHeap`] and [`Heap`] allocators.

pub mod heap;
pub mod raw_heap;

pub use heap::Heap;
pub use raw_heap::{BlockInfo, HeapStats, RawHeap};
