//! Conservation, coalescing and tiling properties of the linear and atlas allocators

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use tessera_core::Region;
use tessera_renderer::atlas::AtlasLeaf;
use tessera_renderer::backend::{HeadlessBackend, MemoryKind};
use tessera_renderer::{LinearAllocation, LinearAllocator, RectAllocator};

/// xorshift64, deterministic across runs
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn range(&mut self, low: u64, high: u64) -> u64 {
        low + self.next() % (high - low)
    }
}

fn assert_linear_conservation(allocator: &LinearAllocator, live: &[LinearAllocation]) {
    for page in allocator.pages() {
        let free: u64 = page.free_blocks.iter().map(|(_, size)| size).sum();
        assert_eq!(page.allocated + free, page.capacity, "page {:?}", page.id);

        let mut ranges: Vec<(u64, u64)> = live
            .iter()
            .filter(|a| a.page_id() == page.id)
            .map(|a| (a.offset(), a.size()))
            .chain(page.free_blocks.iter().copied())
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap in {:?}", pair);
        }
        for pair in page.free_blocks.windows(2) {
            assert!(pair[0].0 + pair[0].1 < pair[1].0, "unmerged neighbours {:?}", pair);
        }
    }
}

#[test]
fn test_linear_conservation_under_random_traffic() {
    let backend = Arc::new(HeadlessBackend::default());
    let allocator = LinearAllocator::with_page_size(backend.clone(), 64 * 1024);
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<LinearAllocation> = Vec::new();

    for step in 0..2_000 {
        if live.is_empty() || rng.next() % 3 != 0 {
            let size = rng.range(1, 4096);
            let align = 1 << rng.range(0, 9);
            let kind = MemoryKind::ALL[(rng.next() % 2) as usize];
            let allocation = allocator.alloc(size, align, kind).unwrap();
            assert_eq!(allocation.offset() % align, 0);
            live.push(allocation);
        } else {
            let index = (rng.next() % live.len() as u64) as usize;
            live.swap_remove(index);
        }
        if step % 100 == 0 {
            assert_linear_conservation(&allocator, &live);
        }
    }

    assert_linear_conservation(&allocator, &live);
    let in_use: u64 = live.iter().map(|a| a.size()).sum();
    assert_eq!(allocator.stats().bytes_in_use, in_use);

    live.clear();
    assert_eq!(allocator.page_count(), 0);
    assert_eq!(backend.live_memory_blocks(), 0);
    assert_eq!(backend.memory_in_use(), 0);
}

#[test]
fn test_linear_coalescing_restores_contiguous_block() {
    let backend = Arc::new(HeadlessBackend::default());
    let allocator = LinearAllocator::with_page_size(backend, 4096);

    let a = allocator.alloc(256, 1, MemoryKind::Storage).unwrap();
    let b = allocator.alloc(256, 1, MemoryKind::Storage).unwrap();
    let c = allocator.alloc(256, 1, MemoryKind::Storage).unwrap();
    // keeps the page resident
    let _d = allocator.alloc(256, 1, MemoryKind::Storage).unwrap();
    let start = a.offset();

    allocator.free(b);
    allocator.free(a);
    allocator.free(c);

    let page = &allocator.pages()[0];
    assert_eq!(page.free_blocks[0], (start, 768));

    let merged = allocator.alloc(768, 1, MemoryKind::Storage).unwrap();
    assert_eq!(merged.offset(), start);
}

fn assert_exact_tiling(width: u32, height: u32, leaves: &[AtlasLeaf]) {
    let page = Region::with_size(width, height);
    let area: u64 = leaves.iter().map(|leaf| leaf.region.area()).sum();
    assert_eq!(area, page.area());
    for (i, leaf) in leaves.iter().enumerate() {
        assert!(page.contains(&leaf.region));
        assert!(!leaf.region.is_empty(), "empty leaf {:?}", leaf);
        for other in &leaves[i + 1..] {
            assert!(
                !leaf.region.intersects(&other.region),
                "{:?} overlaps {:?}",
                leaf,
                other
            );
        }
    }
}

#[test]
fn test_atlas_placements_are_disjoint_and_tile_pages() {
    let backend = Arc::new(HeadlessBackend::default());
    let allocator = RectAllocator::with_page_size(backend.clone(), 256, 1);
    let mut rng = Rng(0xD1B5_4A32_D192_ED03);
    let mut live = Vec::new();

    for _ in 0..600 {
        if live.is_empty() || rng.next() % 4 != 0 {
            let w = rng.range(1, 48) as u32;
            let h = rng.range(1, 48) as u32;
            let allocation = allocator.alloc(w, h).unwrap();
            assert_eq!(allocation.size().x, w);
            assert_eq!(allocation.size().y, h);
            live.push(allocation);
        } else {
            let index = (rng.next() % live.len() as u64) as usize;
            live.swap_remove(index);
        }
    }

    for page in allocator.pages() {
        assert_exact_tiling(page.width, page.height, &page.leaves);
        let used = page.leaves.iter().filter(|leaf| leaf.refcount > 0).count();
        let owned = live.iter().filter(|a| a.page_id() == page.id).count();
        assert_eq!(used, owned);
    }

    live.clear();
    let stats = allocator.stats();
    assert_eq!(stats.placements, 0);
    assert_eq!(stats.pixels_in_use, 0);
    assert_eq!(stats.pages, 1);
    assert_eq!(backend.live_surfaces(), 1);
}

#[test]
fn test_atlas_refcount_lifecycle() {
    let backend = Arc::new(HeadlessBackend::default());
    let allocator = RectAllocator::with_page_size(backend, 512, 1);

    let a = allocator.alloc(40, 24).unwrap();
    let b = a.clone();
    assert_eq!(a.ref_count(), 2);

    drop(a);
    assert_eq!(b.ref_count(), 1);
    assert_eq!(allocator.stats().placements, 1);

    drop(b);
    let stats = allocator.stats();
    assert_eq!(stats.placements, 0);
    assert_eq!(stats.nodes, 1);

    let again = allocator.alloc(40, 24).unwrap();
    assert_eq!(again.region(), Region::new(0, 0, 40, 24));
    assert_eq!(allocator.stats().pages_created, 1);
}

#[test]
fn test_allocators_shared_across_loader_threads() {
    let backend = Arc::new(HeadlessBackend::default());
    let linear = LinearAllocator::with_page_size(backend.clone(), 16 * 1024);
    let atlas = RectAllocator::with_page_size(backend.clone(), 512, 1);

    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let linear = linear.clone();
            let atlas = atlas.clone();
            thread::spawn(move || {
                let mut rng = Rng(seed * 7919 + 1);
                let mut buffers = Vec::new();
                let mut sprites = Vec::new();
                for _ in 0..250 {
                    buffers.push(linear.alloc(rng.range(1, 512), 16, MemoryKind::Vertex).unwrap());
                    let side = rng.range(4, 32) as u32;
                    sprites.push(atlas.alloc(side, side).unwrap());
                    if rng.next() % 2 == 0 {
                        buffers.swap_remove(0);
                        sprites.swap_remove(0);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(linear.stats().allocations, 0);
    assert_eq!(linear.page_count(), 0);
    assert_eq!(atlas.stats().placements, 0);
    assert_eq!(backend.live_memory_blocks(), 0);
}
