use crate::growers::{ArenaGrower, Grower};
use crate::header::{HEADER_ALIGN, HEADER_SIZE};

use self::format::{capture, init_logging};

use super::*;

use core::ptr::NonNull;
use core::slice;
use tracing::Level;


#[repr(C, align(16))]
struct Buf<const N: usize>([u8; N]);

/// A heap over a boxed, aligned buffer of `N` bytes.
struct TestHeap<const N: usize> {
    heap: RawHeap<ArenaGrower>,
    _buf: Box<Buf<N>>,
}

impl<const N: usize> TestHeap<N> {
    fn new() -> Self {
        init_logging();
        let mut buf = Box::new(Buf([0_u8; N]));
        let grower = unsafe { ArenaGrower::new(buf.0.as_mut_ptr(), N) };
        TestHeap {
            heap: unsafe { RawHeap::with_grower(grower) },
            _buf: buf,
        }
    }

    fn end(&mut self) -> *mut u8 {
        self.heap.heap_end().unwrap().as_ptr()
    }
}

fn footprint(size: usize) -> usize {
    HEADER_SIZE + size.next_multiple_of(HEADER_ALIGN)
}

unsafe fn filled(p: *mut u8, len: usize, byte: u8) -> bool {
    slice::from_raw_parts(p, len).iter().all(|&b| b == byte)
}

#[test]
fn test_allocate_release_round_trip() {
    let mut t = TestHeap::<{ 64 * 1024 }>::new();
    for size in (1..2000).step_by(37) {
        let start = t.end();
        let p = t.heap.allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % HEADER_ALIGN, 0);
        assert_eq!(t.end() as usize - start as usize, footprint(size));
        unsafe { t.heap.release(p) };
        assert_eq!(t.end(), start, "Releasing the only block should restore the heap end.");
        assert_eq!(t.heap.stats().blocks, 0);
    }
}

#[test]
fn test_zero_sizes_return_null() {
    let mut t = TestHeap::<1024>::new();
    let start = t.end();
    assert!(t.heap.allocate(0).is_null());
    for k in [0, 1, 7, 4096, usize::MAX] {
        assert!(t.heap.zero_allocate(0, k).is_null());
        assert!(t.heap.zero_allocate(k, 0).is_null());
    }
    assert_eq!(t.end(), start);
}

#[test]
fn test_zero_allocate_overflow() {
    let mut t = TestHeap::<1024>::new();
    let start = t.end();
    let (p, logs) = capture(|| t.heap.zero_allocate(usize::MAX / 2 + 1, 2));
    assert!(p.is_null());
    assert!(logs.contains(Level::WARN, "overflows"));
    assert!(t.heap.zero_allocate(usize::MAX, usize::MAX).is_null());
    assert!(t.heap.zero_allocate(1 << (usize::BITS / 2), 1 << (usize::BITS / 2)).is_null());
    assert_eq!(t.end(), start, "Overflowing requests must not touch the heap.");
}

#[test]
fn test_zero_allocate_zero_fills() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let p = t.heap.allocate(64);
        p.write_bytes(0xFF, 64);
        let _guard = t.heap.allocate(8);
        t.heap.release(p);

        // The dirty block is reused and must be cleared.
        let z = t.heap.zero_allocate(6, 10);
        assert_eq!(z, p);
        assert!(filled(z, 60, 0));

        let fresh = t.heap.zero_allocate(33, 3);
        assert!(!fresh.is_null());
        assert!(filled(fresh, 99, 0));
    }
}

#[test]
fn test_first_fit_reuse() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let p1 = t.heap.allocate(10);
        let p2 = t.heap.allocate(20);
        assert!(!p1.is_null() && !p2.is_null());
        let end = t.end();

        t.heap.release(p1);
        assert_eq!(t.end(), end, "The first block isn't topmost, the heap shouldn't shrink.");
        let blocks: Vec<_> = t.heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_free);
        assert!(!blocks[1].is_free);

        let p3 = t.heap.allocate(5);
        assert_eq!(p3, p1, "The free block should be reused.");
        assert_eq!(t.end(), end, "Reuse shouldn't grow the heap.");
        assert_eq!(t.heap.blocks().next().unwrap().size, 10, "Blocks are never split.");
    }
}

#[test]
fn test_first_fit_not_best_fit() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let big = t.heap.allocate(200);
        let small = t.heap.allocate(16);
        let _guard = t.heap.allocate(8);
        t.heap.release(big);
        t.heap.release(small);

        assert_eq!(t.heap.allocate(16), big);
        assert_eq!(t.heap.allocate(16), small);

        let end = t.end();
        let p = t.heap.allocate(17);
        assert_eq!(p, end.add(HEADER_SIZE), "No free block left, the heap should grow.");
    }
}

#[test]
fn test_too_small_free_block_is_skipped() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let small = t.heap.allocate(16);
        let _guard = t.heap.allocate(8);
        t.heap.release(small);

        let end = t.end();
        let p = t.heap.allocate(17);
        assert_eq!(p, end.add(HEADER_SIZE));
        assert!(t.heap.blocks().next().unwrap().is_free);
    }
}

#[test]
fn test_release_trims_trailing_free_blocks() {
    let mut t = TestHeap::<4096>::new();
    let start = t.end();
    unsafe {
        let p1 = t.heap.allocate(10);
        let p2 = t.heap.allocate(20);
        let p3 = t.heap.allocate(30);
        let after_p1 = start.add(footprint(10));

        t.heap.release(p2);
        assert_eq!(t.heap.stats().free_blocks, 1);

        t.heap.release(p3);
        assert_eq!(t.end(), after_p1, "p2 became topmost and should be returned as well.");
        assert_eq!(t.heap.stats().blocks, 1);

        t.heap.release(p1);
        assert_eq!(t.end(), start);
        assert!(t.heap.blocks().next().is_none());
    }
}

#[test]
fn test_release_null_is_noop() {
    let mut t = TestHeap::<1024>::new();
    let p = t.heap.allocate(8);
    let end = t.end();
    unsafe { t.heap.release(core::ptr::null_mut()) };
    assert_eq!(t.end(), end);
    assert_eq!(t.heap.stats().used_bytes, 8);
    assert!(!p.is_null());
}

#[test]
fn test_resize_within_capacity_keeps_pointer() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let p = t.heap.allocate(64);
        for i in 0..64 {
            *p.add(i) = i as u8;
        }
        let end = t.end();
        for n in [1, 32, 63, 64] {
            assert_eq!(t.heap.resize(p, n), p);
        }
        assert_eq!(t.end(), end);
        assert_eq!(t.heap.blocks().next().unwrap().size, 64, "Capacity is never shrunk.");
        for i in 0..64 {
            assert_eq!(*p.add(i), i as u8);
        }
    }
}

#[test]
fn test_resize_grows_and_copies() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let p = t.heap.allocate(24);
        for i in 0..24 {
            *p.add(i) = 0xA0 + i as u8;
        }
        let q = t.heap.resize(p, 100);
        assert!(!q.is_null());
        assert_ne!(p, q);
        for i in 0..24 {
            assert_eq!(*q.add(i), 0xA0 + i as u8);
        }

        let blocks: Vec<_> = t.heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_free, "The old block should be released.");
        assert_eq!(blocks[1].payload.as_ptr(), q);
        assert_eq!(blocks[1].size, 100);
    }
}

#[test]
fn test_resize_topmost_block() {
    let mut t = TestHeap::<4096>::new();
    let start = t.end();
    unsafe {
        let p = t.heap.allocate(16);
        let q = t.heap.resize(p, 48);
        assert_eq!(q, start.add(footprint(16) + HEADER_SIZE));
        t.heap.release(q);
        assert_eq!(t.end(), start);
    }
}

#[test]
fn test_resize_null_and_zero() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let start = t.end();
        let p = t.heap.resize(core::ptr::null_mut(), 40);
        assert_eq!(p, start.add(HEADER_SIZE), "resize(null, n) should allocate.");

        let end = t.end();
        assert!(t.heap.resize(p, 0).is_null());
        assert_eq!(t.end(), end);
        let blocks: Vec<_> = t.heap.blocks().collect();
        assert!(!blocks[0].is_free, "resize(p, 0) must not release p.");

        assert!(t.heap.resize(core::ptr::null_mut(), 0).is_null());
    }
}

#[test]
fn test_resize_failure_keeps_old_block() {
    let mut t = TestHeap::<256>::new();
    unsafe {
        let p = t.heap.allocate(32);
        p.write_bytes(0x5A, 32);
        let end = t.end();

        let (q, logs) = capture(|| t.heap.resize(p, 4096));
        assert!(q.is_null());
        assert!(logs.contains(Level::ERROR, "Growth failure, no memory."));
        assert_eq!(t.end(), end);
        assert!(filled(p, 32, 0x5A));
        assert!(!t.heap.blocks().next().unwrap().is_free);

        t.heap.release(p);
        assert_eq!(t.heap.stats().blocks, 0);
    }
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let mut t = TestHeap::<512>::new();
    let start = t.end();
    let mut ptrs = vec![];
    loop {
        let p = t.heap.allocate(48);
        if p.is_null() {
            break;
        }
        ptrs.push(p);
    }
    assert_eq!(ptrs.len(), 512 / footprint(48));
    assert_eq!(t.heap.grower().remaining(), 512 % footprint(48));

    let (p, logs) = capture(|| t.heap.allocate(1));
    assert!(p.is_null());
    assert!(logs.contains(Level::ERROR, "Growth failure, no memory."));

    // A failed growth leaves the heap usable.
    unsafe { t.heap.release(ptrs[1]) };
    assert_eq!(t.heap.allocate(1), ptrs[1]);

    for p in ptrs.into_iter().rev() {
        unsafe { t.heap.release(p) };
    }
    assert_eq!(t.end(), start);
}

#[test]
fn test_huge_request_fails() {
    let mut t = TestHeap::<1024>::new();
    let start = t.end();
    let (p, logs) = capture(|| t.heap.allocate(usize::MAX - 8));
    assert!(p.is_null());
    assert!(logs.contains(Level::ERROR, "object is too big"));
    assert!(t.heap.allocate(isize::MAX as usize).is_null());
    assert_eq!(t.end(), start);
}

#[test]
fn test_foreign_pointer_is_ignored() {
    let mut t = TestHeap::<1024>::new();
    let p = t.heap.allocate(32);
    let end = t.end();
    let mut local = [0_u64; 4];

    let ((), logs) = capture(|| unsafe {
        t.heap.release(local.as_mut_ptr().cast());
        t.heap.release(p.add(1));
        t.heap.release(p.add(HEADER_ALIGN));
    });
    assert_eq!(logs.events().len(), 3);
    assert!(logs.contains(Level::WARN, "not owned by this heap"));
    assert_eq!(t.end(), end);
    assert_eq!(t.heap.stats().free_blocks, 0);

    assert!(unsafe { t.heap.resize(local.as_mut_ptr().cast(), 64) }.is_null());
    assert_eq!(t.end(), end);
}

#[test]
fn test_double_release_is_ignored() {
    let mut t = TestHeap::<1024>::new();
    unsafe {
        let p1 = t.heap.allocate(32);
        let p2 = t.heap.allocate(32);
        t.heap.release(p1);
        let end = t.end();

        let ((), logs) = capture(|| t.heap.release(p1));
        assert!(logs.contains(Level::WARN, "already released"));
        assert_eq!(t.end(), end);
        assert_eq!(t.heap.stats().free_blocks, 1);

        // A released topmost block is gone from the list altogether.
        t.heap.release(p2);
        let start = t.end();
        let ((), logs) = capture(|| t.heap.release(p2));
        assert!(logs.contains(Level::WARN, "not owned by this heap"));
        assert_eq!(t.end(), start);
    }
}

#[test]
fn test_stats() {
    let mut t = TestHeap::<4096>::new();
    unsafe {
        let a = t.heap.allocate(10);
        let _b = t.heap.allocate(20);
        let c = t.heap.allocate(30);
        let _d = t.heap.allocate(40);
        t.heap.release(a);
        t.heap.release(c);
    }
    assert_eq!(
        t.heap.stats(),
        HeapStats {
            blocks: 4,
            free_blocks: 2,
            free_bytes: 40,
            used_bytes: 60,
        }
    );
}

#[test]
fn test_blocks_are_contiguous() {
    let mut t = TestHeap::<{ 16 * 1024 }>::new();
    let start = t.end();
    let sizes = [1, 15, 16, 17, 100, 3, 64, 250];
    for &size in &sizes {
        assert!(!t.heap.allocate(size).is_null());
    }

    let mut expected = start;
    for (block, &size) in t.heap.blocks().zip(&sizes) {
        assert_eq!(block.payload.as_ptr(), expected.wrapping_add(HEADER_SIZE));
        assert_eq!(block.size, size);
        expected = expected.wrapping_add(footprint(size));
    }
    assert_eq!(t.end(), expected);
}

/// An arena grower that never gives memory back.
struct NoShrinkGrower(ArenaGrower);

unsafe impl Grower for NoShrinkGrower {
    unsafe fn adjust(&mut self, increment: isize) -> Result<NonNull<u8>, ()> {
        if increment < 0 {
            return Err(());
        }
        self.0.adjust(increment)
    }
}

#[test]
fn test_release_when_grower_refuses_to_shrink() {
    const SIZE: usize = 1024;
    let mut buf = Box::new(Buf([0_u8; SIZE]));
    let grower = NoShrinkGrower(unsafe { ArenaGrower::new(buf.0.as_mut_ptr(), SIZE) });
    let mut heap = unsafe { RawHeap::with_grower(grower) };

    unsafe {
        let p1 = heap.allocate(40);
        let p2 = heap.allocate(40);
        let end = heap.heap_end().unwrap();

        heap.release(p1);
        let ((), logs) = capture(|| heap.release(p2));
        assert!(logs.contains(Level::ERROR, "Shrink failure"));
        assert_eq!(heap.heap_end().unwrap(), end, "The heap end shouldn't move.");

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2, "Both blocks should still be listed.");
        assert!(blocks.iter().all(|b| b.is_free));
        assert_eq!(blocks[1].payload.as_ptr(), p2);

        assert_eq!(heap.allocate(40), p1);
        assert_eq!(heap.allocate(40), p2);
        assert_eq!(heap.heap_end().unwrap(), end, "Reuse shouldn't grow the heap.");
        assert_eq!(heap.stats().free_blocks, 0);
    }
    drop(heap);
    drop(buf);
}
