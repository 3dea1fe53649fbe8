use crate::growers::{ArenaGrower, BufferGrower};

use self::format::init_logging;

use super::*;


const INITIAL_HEAP: usize = RESERVED_SIZE as usize + CHUNK_SIZE as usize;

fn allocator(capacity: usize) -> SegMalloc<BufferGrower> {
    init_logging();
    let mut allocator = SegMalloc::new(BufferGrower::with_capacity(capacity));
    allocator.init().unwrap();
    allocator
}

/// (offset, size, allocated) of every block.
fn layout<G: Grower>(allocator: &SegMalloc<G>) -> Vec<(usize, usize, bool)> {
    allocator
        .blocks()
        .map(|b| (b.offset, b.size, b.allocated))
        .collect()
}

fn offset_of<G: Grower>(allocator: &SegMalloc<G>, ptr: NonNull<u8>) -> usize {
    allocator
        .blocks()
        .find(|b| b.payload == ptr)
        .expect("pointer should be a block payload")
        .offset
}

fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
    }
}

fn holds(ptr: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == seed.wrapping_add(i as u8))
}

#[test]
fn test_init() {
    let allocator = allocator(1 << 16);
    assert!(allocator.is_initialized());
    assert_eq!(allocator.heap_size(), INITIAL_HEAP);
    assert_eq!(layout(&allocator), [(96, 4096, false)]);

    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, CHUNK_SIZE as usize);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(allocator.heap.class_members(classify(CHUNK_SIZE)).count(), 1);
}

#[test]
fn test_init_twice() {
    let mut allocator = allocator(1 << 16);
    assert_eq!(allocator.init(), Err(InitError::AlreadyInitialized));
    assert_eq!(allocator.heap_size(), INITIAL_HEAP);
}

#[test]
fn test_init_exhausted() {
    // Room for the sentinels but not for the first chunk.
    let mut allocator = SegMalloc::new(BufferGrower::with_capacity(INITIAL_HEAP - 8));
    assert_eq!(allocator.init(), Err(InitError::HeapExhausted));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.check_heap(), Err(HeapError::Uninitialized));
    // Retrying still finds no room, but never reports a finished initialization.
    assert_eq!(allocator.init(), Err(InitError::HeapExhausted));
    assert!(allocator.allocate(8).is_none());
    assert!(!allocator.is_initialized());

    // Not even room for the sentinels.
    let mut allocator = SegMalloc::new(BufferGrower::with_capacity(64));
    assert_eq!(allocator.init(), Err(InitError::HeapExhausted));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.check_heap(), Err(HeapError::Uninitialized));
}

/// Refuses the first `failures` growth requests past the sentinels.
struct FailingGrower {
    inner: BufferGrower,
    failures: usize,
}

unsafe impl Grower for FailingGrower {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        if !self.inner.is_empty() && self.failures > 0 {
            self.failures -= 1;
            return Err(GrowError);
        }
        self.inner.grow(size)
    }
}

#[test]
fn test_init_retry() {
    init_logging();
    let mut allocator = SegMalloc::new(FailingGrower {
        inner: BufferGrower::with_capacity(1 << 16),
        failures: 1,
    });
    assert_eq!(allocator.init(), Err(InitError::HeapExhausted));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.heap_size(), RESERVED_SIZE as usize);

    assert_eq!(allocator.init(), Ok(()));
    assert!(allocator.is_initialized());
    assert_eq!(allocator.heap_size(), INITIAL_HEAP);
    assert_eq!(layout(&allocator), [(96, 4096, false)]);
    allocator.check_heap().unwrap();
    assert_eq!(allocator.init(), Err(InitError::AlreadyInitialized));
}

#[test]
fn test_lazy_init_after_failed_init() {
    init_logging();
    let mut allocator = SegMalloc::new(FailingGrower {
        inner: BufferGrower::with_capacity(1 << 16),
        failures: 1,
    });
    assert_eq!(allocator.init(), Err(InitError::HeapExhausted));
    let p = allocator.allocate(10).unwrap();
    assert!(allocator.is_initialized());
    assert_eq!(offset_of(&allocator, p), 96);
    allocator.check_heap().unwrap();
}

#[test]
fn test_lazy_init() {
    let mut allocator = SegMalloc::new(BufferGrower::with_capacity(1 << 16));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.blocks().count(), 0);
    let p = allocator.allocate(10).unwrap();
    assert!(allocator.is_initialized());
    assert_eq!(allocator.heap_size(), INITIAL_HEAP);
    assert_eq!(offset_of(&allocator, p), 96);
}

#[test]
fn test_zero_size() {
    let mut allocator = allocator(1 << 16);
    assert!(allocator.allocate(0).is_none());
    assert_eq!(layout(&allocator), [(96, 4096, false)]);
}

#[test]
fn test_block_sizes() {
    let mut allocator = allocator(1 << 16);
    unsafe {
        for (request, block_size) in [(1, 16), (8, 16), (9, 24), (16, 24), (17, 32), (100, 112)] {
            let p = allocator.allocate(request).unwrap();
            assert_eq!(allocator.block_size(p), block_size, "request of {request} bytes");
            assert_eq!(allocator.usable_size(p), block_size - 8);
        }
    }
    allocator.check_heap().unwrap();
}

#[test]
fn test_alignment() {
    let mut allocator = allocator(1 << 20);
    for size in 1..300 {
        let p = allocator.allocate(size).unwrap();
        assert_eq!(p.as_ptr() as usize % 8, 0);
    }
    allocator.check_heap().unwrap();
}

#[test]
fn test_scenario_100_200() {
    let mut allocator = allocator(1 << 16);
    let p1 = allocator.allocate(100).unwrap();
    let p2 = allocator.allocate(200).unwrap();
    assert_eq!(
        layout(&allocator),
        [(96, 112, true), (208, 208, true), (416, 3776, false)]
    );

    unsafe { allocator.deallocate(p1) };
    assert_eq!(
        layout(&allocator),
        [(96, 112, false), (208, 208, true), (416, 3776, false)]
    );
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_bytes, CHUNK_SIZE as usize - 208);

    unsafe { allocator.deallocate(p2) };
    assert_eq!(layout(&allocator), [(96, 4096, false)]);
    allocator.check_heap().unwrap();
}

#[test]
fn test_reuse() {
    let mut allocator = allocator(1 << 16);
    let _guard = allocator.allocate(40).unwrap();
    for size in [1, 24, 100, 1000, 3000] {
        let p = allocator.allocate(size).unwrap();
        unsafe { allocator.deallocate(p) };
        let heap_size = allocator.heap_size();
        assert_eq!(allocator.allocate(size), Some(p));
        assert_eq!(allocator.heap_size(), heap_size);
        unsafe { allocator.deallocate(p) };
    }
    allocator.check_heap().unwrap();
}

#[test]
fn test_merge_cases() {
    let mut allocator = allocator(1 << 16);
    let [a, b, c, d] = [(); 4].map(|_| allocator.allocate(16).unwrap());
    assert_eq!(
        layout(&allocator),
        [
            (96, 24, true),
            (120, 24, true),
            (144, 24, true),
            (168, 24, true),
            (192, 4000, false)
        ]
    );

    unsafe {
        // Both neighbors allocated.
        allocator.deallocate(b);
        assert_eq!(layout(&allocator)[1], (120, 24, false));
        allocator.check_heap().unwrap();

        // Next neighbor free.
        allocator.deallocate(a);
        assert_eq!(layout(&allocator)[..2], [(96, 48, false), (144, 24, true)]);
        allocator.check_heap().unwrap();

        // Previous neighbor free.
        allocator.deallocate(c);
        assert_eq!(layout(&allocator)[..2], [(96, 72, false), (168, 24, true)]);
        allocator.check_heap().unwrap();

        // Both neighbors free.
        allocator.deallocate(d);
    }
    assert_eq!(layout(&allocator), [(96, 4096, false)]);
    allocator.check_heap().unwrap();
}

#[test]
fn test_merge_maximal_run() {
    let mut allocator = allocator(1 << 16);
    let _p = allocator.allocate(64).unwrap();
    let before = layout(&allocator);
    let block = BlockRef::new(before[1].0 as u32).unwrap();
    let class = classify(before[1].1 as u32);

    // Merging an already maximal free run changes nothing.
    allocator.heap.remove(block);
    assert_eq!(allocator.merge(block), block);
    assert_eq!(layout(&allocator), before);
    assert_eq!(allocator.heap.class_members(class).collect::<Vec<_>>(), [block]);
    allocator.check_heap().unwrap();
}

#[test]
fn test_best_fit_within_class() {
    let mut allocator = allocator(1 << 16);
    let a = allocator.allocate(240).unwrap();
    let _g1 = allocator.allocate(8).unwrap();
    let b = allocator.allocate(150).unwrap();
    let _g2 = allocator.allocate(8).unwrap();
    let c = allocator.allocate(200).unwrap();
    let _g3 = allocator.allocate(8).unwrap();
    unsafe {
        assert_eq!(allocator.block_size(a), 248);
        assert_eq!(allocator.block_size(b), 160);
        assert_eq!(allocator.block_size(c), 208);
        allocator.deallocate(a);
        allocator.deallocate(b);
        allocator.deallocate(c);
    }
    assert_eq!(allocator.heap.class_members(4).count(), 3);

    // Exact fit in the middle of the list.
    assert_eq!(allocator.allocate(150), Some(b));
    // Smallest of the remaining large enough blocks, taken whole.
    assert_eq!(allocator.allocate(190), Some(c));
    unsafe { assert_eq!(allocator.block_size(c), 208) };
    allocator.check_heap().unwrap();
}

#[test]
fn test_class_escalation() {
    let mut allocator = allocator(1 << 16);
    let a = allocator.allocate(30).unwrap();
    let _g = allocator.allocate(8).unwrap();
    unsafe {
        assert_eq!(allocator.block_size(a), 40);
        allocator.deallocate(a);
    }

    // Class 1 is empty, the 40-byte block of class 2 comes before the large one.
    let p = allocator.allocate(10).unwrap();
    assert_eq!(p, a);
    unsafe { assert_eq!(allocator.block_size(p), 24) };

    // The 16-byte remainder was split off and filed in class 0.
    let q = allocator.allocate(1).unwrap();
    assert_eq!(offset_of(&allocator, q), offset_of(&allocator, p) + 24);
    allocator.check_heap().unwrap();
}

#[test]
fn test_extend_merges_with_last_block() {
    let mut allocator = allocator(1 << 16);
    let _p1 = allocator.allocate(4000).unwrap();
    assert_eq!(layout(&allocator), [(96, 4008, true), (4104, 88, false)]);

    let p2 = allocator.allocate(200).unwrap();
    assert_eq!(allocator.heap_size(), INITIAL_HEAP + CHUNK_SIZE as usize);
    assert_eq!(offset_of(&allocator, p2), 4104);
    assert_eq!(
        layout(&allocator),
        [(96, 4008, true), (4104, 208, true), (4312, 3976, false)]
    );
    allocator.check_heap().unwrap();
}

#[test]
fn test_extend_odd_word_count() {
    let mut allocator = allocator(1 << 16);
    let block = allocator.extend_heap(3).unwrap();
    // Rounded up to 4 words and merged with the free chunk before it.
    assert_eq!(allocator.heap_size(), INITIAL_HEAP + 16);
    assert_eq!(block, BlockRef::new(FIRST_BLOCK).unwrap());
    assert_eq!(layout(&allocator), [(96, 4112, false)]);
    allocator.check_heap().unwrap();

    let _p = allocator.allocate(4100).unwrap();
    let block = allocator.extend_heap(5).unwrap();
    assert_eq!(allocator.heap_size(), INITIAL_HEAP + 16 + 24);
    assert_eq!(layout(&allocator), [(96, 4112, true), (4208, 24, false)]);
    assert_eq!(block.offset(), 4208);
    allocator.check_heap().unwrap();
}

#[test]
fn test_large_request() {
    let mut allocator = allocator(1 << 16);
    let p = allocator.allocate(10_000).unwrap();
    assert_eq!(allocator.heap_size(), INITIAL_HEAP + 10_008);
    assert_eq!(offset_of(&allocator, p), 96);
    assert_eq!(layout(&allocator), [(96, 10_008, true), (10_104, 4096, false)]);
    allocator.check_heap().unwrap();
}

#[test]
fn test_heap_exhausted() {
    let mut allocator = allocator(INITIAL_HEAP);
    assert!(allocator.allocate(4096).is_none());
    assert!(allocator.allocate(usize::MAX).is_none());
    assert_eq!(allocator.heap_size(), INITIAL_HEAP);
    allocator.check_heap().unwrap();

    // The heap is still usable.
    let p = allocator.allocate(4000).unwrap();
    assert!(allocator.allocate(100).is_none());
    unsafe { allocator.deallocate(p) };
    assert!(allocator.allocate(4088).is_some());
    allocator.check_heap().unwrap();
}

#[test]
fn test_arena_grower() {
    let mut buf = vec![0_u64; 4096];
    let grower = unsafe { ArenaGrower::new(buf.as_mut_ptr().cast(), buf.len() * 8) };
    let mut allocator = SegMalloc::new(grower);
    allocator.init().unwrap();

    let mut objects = vec![];
    for i in 0..8 {
        for j in i..8 {
            let size = (1 << j) + i;
            let p = allocator.allocate(size).unwrap();
            fill(p, size, i as u8);
            objects.push((p, size, i as u8));
        }
    }

    for (i, &(p, size, seed)) in objects.iter().enumerate() {
        assert!(holds(p, size, seed));
        if i != objects.len() - 1 {
            assert!(p.as_ptr() as usize + size <= objects[i + 1].0.as_ptr() as usize);
        }
        unsafe { allocator.deallocate(p) };
        assert_eq!(allocator.allocate(size), Some(p));
    }

    for &(p, _, _) in objects.iter().rev() {
        unsafe { allocator.deallocate(p) };
    }
    let stats = allocator.check_heap().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.blocks, 1);
}

#[test]
fn test_realloc_null_and_zero() {
    let mut allocator = allocator(1 << 16);
    unsafe {
        let p = allocator.reallocate(None, 24).unwrap();
        assert_eq!(allocator.block_size(p), 32);
        assert!(allocator.reallocate(Some(p), 0).is_none());
        assert!(allocator.reallocate(None, 0).is_none());
    }
    assert_eq!(layout(&allocator), [(96, 4096, false)]);
}

#[test]
fn test_realloc_smaller() {
    let mut allocator = allocator(1 << 16);
    let p = allocator.allocate(64).unwrap();
    fill(p, 64, 7);

    let q = unsafe { allocator.reallocate(Some(p), 16).unwrap() };
    assert_ne!(p, q);
    assert!(holds(q, 16, 7));
    unsafe { assert_eq!(allocator.block_size(q), 24) };
    assert_eq!(
        layout(&allocator),
        [(96, 72, false), (168, 24, true), (192, 4000, false)]
    );
    allocator.check_heap().unwrap();
}

#[test]
fn test_realloc_larger() {
    let mut allocator = allocator(1 << 16);
    let p = allocator.allocate(32).unwrap();
    fill(p, 32, 42);
    let _guard = allocator.allocate(8).unwrap();

    let q = unsafe { allocator.reallocate(Some(p), 1000).unwrap() };
    assert!(holds(q, 32, 42));
    unsafe { assert!(allocator.usable_size(q) >= 1000) };
    assert!(!allocator.blocks().any(|b| b.payload == p && b.allocated));
    allocator.check_heap().unwrap();
}

#[test]
fn test_realloc_failure_keeps_block() {
    let mut allocator = allocator(INITIAL_HEAP);
    let p = allocator.allocate(100).unwrap();
    fill(p, 100, 3);

    assert!(unsafe { allocator.reallocate(Some(p), 5000) }.is_none());
    assert!(holds(p, 100, 3));
    unsafe { assert_eq!(allocator.block_size(p), 112) };
    allocator.check_heap().unwrap();
}

#[test]
#[should_panic]
fn test_foreign_pointer() {
    let mut allocator = allocator(1 << 16);
    let mut outside = 0_u64;
    unsafe { allocator.deallocate(NonNull::from(&mut outside).cast()) };
}

#[test]
#[cfg(debug_assertions)]
#[should_panic]
fn test_double_free() {
    let mut allocator = allocator(1 << 16);
    let p = allocator.allocate(16).unwrap();
    let _guard = allocator.allocate(16).unwrap();
    unsafe {
        allocator.deallocate(p);
        allocator.deallocate(p);
    }
}

#[test]
fn test_check_heap_detects_corruption() {
    let mut allocator = allocator(1 << 16);
    let p = allocator.allocate(16).unwrap();
    let block = BlockRef::new(offset_of(&allocator, p) as u32).unwrap();

    // Footer no longer matches the header.
    allocator.heap.put(block.footer(24), Header::new(32, true).raw());
    assert_eq!(
        allocator.check_heap(),
        Err(HeapError::TagMismatch { offset: 96 })
    );
    allocator.heap.set_tags(block, Header::new(24, true));
    allocator.check_heap().unwrap();

    // A free block that no list knows about.
    let rest = allocator.heap.next(block);
    allocator.heap.remove(rest);
    assert_eq!(
        allocator.check_heap(),
        Err(HeapError::Unlisted {
            offset: rest.offset() as usize
        })
    );
    allocator.heap.insert(rest);
    allocator.check_heap().unwrap();

    // A free block next to another free block.
    allocator.heap.set_tags(block, Header::new(24, false));
    allocator.heap.insert(block);
    assert_eq!(
        allocator.check_heap(),
        Err(HeapError::AdjacentFree {
            offset: rest.offset() as usize
        })
    );
}

#[test]
fn test_check_heap_detects_bad_links() {
    let mut allocator = allocator(1 << 16);
    let blocks: Vec<_> = (0..6).map(|_| allocator.allocate(16).unwrap()).collect();
    unsafe {
        allocator.deallocate(blocks[0]);
        allocator.deallocate(blocks[2]);
        allocator.deallocate(blocks[4]);
    }
    allocator.check_heap().unwrap();
    let members: Vec<_> = allocator.heap.class_members(1).collect();
    assert_eq!(members.len(), 3);

    // Break the back link of the second member.
    allocator.heap.set_prev_link(members[1], None);
    assert_eq!(
        allocator.check_heap(),
        Err(HeapError::BrokenLink {
            offset: members[1].offset() as usize
        })
    );
}

#[test]
fn test_display() {
    assert_eq!(
        InitError::HeapExhausted.to_string(),
        "heap exhausted while initializing the allocator"
    );
    assert_eq!(
        HeapError::AdjacentFree { offset: 0x60 }.to_string(),
        "free block 0x60 follows another free block"
    );
}
