//! Linear sub-allocator for device memory
//!
//! Pages are large blocks obtained from the [`MemoryProvider`], one
//! [`MemoryKind`] each. Every page keeps its free ranges as an offset-sorted
//! list; allocation is first fit, free merges the range with both neighbours,
//! and a page goes back to the provider the moment nothing in it is allocated.

use crate::backend::{MemoryHandle, MemoryKind, SharedProvider};
use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tessera_core::logging::LogCategory;
use tessera_core::{
    tessera_debug, ErrorContext, MemoryConfig, Result, TesseraError,
};
use tracing::{debug, instrument, warn};

slotmap::new_key_type! {
    /// Identifies one linear page for as long as it is resident
    pub struct LinearPageId;
}

/// Free sub-range of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    offset: u64,
    size: u64,
}

impl Block {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

struct LinearPage {
    memory: MemoryHandle,
    kind: MemoryKind,
    capacity: u64,
    allocated: u64,
    live: usize,
    /// Sorted by offset, never two adjacent entries
    free: SmallVec<[Block; 8]>,
}

impl LinearPage {
    fn new(memory: MemoryHandle, kind: MemoryKind, capacity: u64) -> Self {
        let mut free = SmallVec::new();
        free.push(Block {
            offset: 0,
            size: capacity,
        });
        Self {
            memory,
            kind,
            capacity,
            allocated: 0,
            live: 0,
            free,
        }
    }

    /// First free block whose aligned start leaves room for `size` bytes
    fn find_fit(&self, size: u64, align: u64) -> Option<(usize, u64)> {
        self.free.iter().enumerate().find_map(|(index, block)| {
            let start = block.offset.checked_add(align - 1)? & !(align - 1);
            let end = start.checked_add(size)?;
            (end <= block.end()).then_some((index, start))
        })
    }

    /// Carve `[start, start + size)` out of free block `index`
    fn take(&mut self, index: usize, start: u64, size: u64) {
        let block = self.free[index];
        let leading = Block {
            offset: block.offset,
            size: start - block.offset,
        };
        let trailing = Block {
            offset: start + size,
            size: block.end() - (start + size),
        };

        self.free.remove(index);
        if trailing.size > 0 {
            self.free.insert(index, trailing);
        }
        if leading.size > 0 {
            self.free.insert(index, leading);
        }

        self.allocated += size;
        self.live += 1;
    }

    /// Return a range and merge it with the neighbouring free blocks
    fn give_back(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|b| b.offset < offset);
        let mut block = Block { offset, size };
        let mut index = index;

        if index > 0 && self.free[index - 1].end() == block.offset {
            index -= 1;
            block.offset = self.free[index].offset;
            block.size += self.free[index].size;
            self.free.remove(index);
        }
        if index < self.free.len() && block.end() == self.free[index].offset {
            block.size += self.free[index].size;
            self.free.remove(index);
        }
        self.free.insert(index, block);

        self.allocated -= size;
        self.live -= 1;
    }

    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|b| b.size).sum()
    }

    fn largest_free_block(&self) -> u64 {
        self.free.iter().map(|b| b.size).max().unwrap_or(0)
    }
}

/// Linear allocator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearStats {
    /// Resident pages
    pub pages: usize,
    /// Sum of resident page capacities
    pub page_bytes: u64,
    pub bytes_in_use: u64,
    pub peak_bytes_in_use: u64,
    /// Live allocations
    pub allocations: usize,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
    pub pages_created: u64,
    pub pages_released: u64,
}

/// Snapshot of one resident page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearPageInfo {
    pub id: LinearPageId,
    pub kind: MemoryKind,
    pub capacity: u64,
    pub allocated: u64,
    pub live_allocations: usize,
    /// `(offset, size)` of every free block, in offset order
    pub free_blocks: Vec<(u64, u64)>,
}

struct LinearState {
    pages: SlotMap<LinearPageId, LinearPage>,
    stats: LinearStats,
}

struct LinearShared {
    provider: SharedProvider,
    default_page_size: u64,
    state: Mutex<LinearState>,
}

impl LinearShared {
    fn release(&self, page_id: LinearPageId, offset: u64, size: u64) {
        let mut state = self.state.lock();
        let Some(page) = state.pages.get_mut(page_id) else {
            warn!("release into unknown linear page {:?}", page_id);
            return;
        };
        page.give_back(offset, size);

        let emptied = page.allocated == 0;
        state.stats.bytes_in_use -= size;
        state.stats.allocations -= 1;
        state.stats.total_frees += 1;

        if emptied {
            if let Some(page) = state.pages.remove(page_id) {
                self.provider
                    .free_memory(page.memory, page.capacity, page.kind);
                state.stats.pages -= 1;
                state.stats.page_bytes -= page.capacity;
                state.stats.pages_released += 1;
                tessera_debug!(
                    LogCategory::Memory,
                    "Released {} page of {} bytes",
                    page.kind.as_str(),
                    page.capacity
                );
            }
        }
    }
}

impl Drop for LinearShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, page) in state.pages.drain() {
            self.provider
                .free_memory(page.memory, page.capacity, page.kind);
        }
    }
}

/// Thread-safe first-fit sub-allocator over provider pages.
///
/// Cloning is cheap and yields another handle to the same pages.
#[derive(Clone)]
pub struct LinearAllocator {
    shared: Arc<LinearShared>,
}

impl LinearAllocator {
    pub fn new(provider: SharedProvider, config: &MemoryConfig) -> Self {
        Self::with_page_size(provider, config.default_page_size)
    }

    pub fn with_page_size(provider: SharedProvider, default_page_size: u64) -> Self {
        Self {
            shared: Arc::new(LinearShared {
                provider,
                default_page_size: default_page_size.max(1),
                state: Mutex::new(LinearState {
                    pages: SlotMap::with_key(),
                    stats: LinearStats::default(),
                }),
            }),
        }
    }

    pub fn default_page_size(&self) -> u64 {
        self.shared.default_page_size
    }

    /// Allocate `size` bytes aligned to `align` from a page of `kind`
    #[instrument(skip(self), level = "trace")]
    pub fn alloc(&self, size: u64, align: u64, kind: MemoryKind) -> Result<LinearAllocation> {
        if size == 0 {
            return Err(TesseraError::invalid_argument_with_context(
                "zero-sized allocation",
                ErrorContext::new("alloc", "LinearAllocator"),
            ));
        }
        if !align.is_power_of_two() {
            return Err(TesseraError::invalid_argument_with_context(
                format!("alignment {} is not a power of two", align),
                ErrorContext::new("alloc", "LinearAllocator").with_metadata("size", size),
            ));
        }

        let mut state = self.shared.state.lock();

        let found = state
            .pages
            .iter()
            .filter(|(_, page)| page.kind == kind && size <= page.capacity - page.allocated)
            .find_map(|(id, page)| page.find_fit(size, align).map(|fit| (id, fit)));

        let (page_id, (index, start)) = match found {
            Some(found) => found,
            None => {
                let page_id = self.create_page(&mut state, size, kind)?;
                let fit = state.pages[page_id].find_fit(size, align).ok_or_else(|| {
                    TesseraError::out_of_memory(format!(
                        "fresh {} page cannot hold {} bytes",
                        kind.as_str(),
                        size
                    ))
                })?;
                (page_id, fit)
            }
        };

        let page = &mut state.pages[page_id];
        page.take(index, start, size);
        let memory = page.memory;

        let stats = &mut state.stats;
        stats.bytes_in_use += size;
        stats.peak_bytes_in_use = stats.peak_bytes_in_use.max(stats.bytes_in_use);
        stats.allocations += 1;
        stats.total_allocations += 1;

        Ok(LinearAllocation {
            shared: self.shared.clone(),
            page: page_id,
            memory,
            offset: start,
            size,
            kind,
        })
    }

    fn create_page(
        &self,
        state: &mut LinearState,
        size: u64,
        kind: MemoryKind,
    ) -> Result<LinearPageId> {
        let capacity = self.shared.default_page_size.max(size);
        let Some(memory) = self.shared.provider.alloc_memory(capacity, kind) else {
            state.stats.failed_allocations += 1;
            return Err(TesseraError::out_of_memory_with_context(
                format!("provider refused a {} byte {} page", capacity, kind.as_str()),
                ErrorContext::new("create_page", "LinearAllocator")
                    .with_metadata("request", size)
                    .with_metadata("resident_pages", state.pages.len()),
            ));
        };

        let id = state.pages.insert(LinearPage::new(memory, kind, capacity));
        state.stats.pages += 1;
        state.stats.page_bytes += capacity;
        state.stats.pages_created += 1;
        debug!("new {} page {:?}: {} bytes", kind.as_str(), id, capacity);
        Ok(id)
    }

    /// Return an allocation. Same as dropping it.
    pub fn free(&self, allocation: LinearAllocation) {
        drop(allocation);
    }

    pub fn stats(&self) -> LinearStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn page_count(&self) -> usize {
        self.shared.state.lock().pages.len()
    }

    /// Share of free bytes that lie outside the largest free block of their page.
    /// Zero when every page has at most one free block.
    pub fn fragmentation(&self) -> f32 {
        let state = self.shared.state.lock();
        let (free, largest) = state
            .pages
            .values()
            .fold((0u64, 0u64), |(free, largest), page| {
                (free + page.free_bytes(), largest + page.largest_free_block())
            });
        if free == 0 {
            return 0.0;
        }
        1.0 - largest as f32 / free as f32
    }

    /// Snapshot every resident page
    pub fn pages(&self) -> Vec<LinearPageInfo> {
        let state = self.shared.state.lock();
        state
            .pages
            .iter()
            .map(|(id, page)| LinearPageInfo {
                id,
                kind: page.kind,
                capacity: page.capacity,
                allocated: page.allocated,
                live_allocations: page.live,
                free_blocks: page.free.iter().map(|b| (b.offset, b.size)).collect(),
            })
            .collect()
    }
}

impl fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("default_page_size", &self.shared.default_page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A sub-range of one linear page. Dropping it returns the range.
pub struct LinearAllocation {
    shared: Arc<LinearShared>,
    page: LinearPageId,
    memory: MemoryHandle,
    offset: u64,
    size: u64,
    kind: MemoryKind,
}

impl LinearAllocation {
    /// Backing memory block of the page
    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    /// Byte offset inside [`memory`](Self::memory)
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn page_id(&self) -> LinearPageId {
        self.page
    }

    /// Absolute offset of `relative` inside the backing block, if it lies within
    /// this allocation together with `len` bytes
    pub fn range_offset(&self, relative: u64, len: u64) -> Option<u64> {
        let end = relative.checked_add(len)?;
        (end <= self.size).then_some(self.offset + relative)
    }
}

impl Drop for LinearAllocation {
    fn drop(&mut self) {
        self.shared.release(self.page, self.offset, self.size);
    }
}

impl fmt::Debug for LinearAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocation")
            .field("page", &self.page)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Round `offset` up to a power-of-two `alignment`
pub(crate) fn align_offset(offset: u64, alignment: u64) -> u64 {
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, HeadlessConfig};
    use pretty_assertions::assert_eq;

    fn allocator(page_size: u64) -> (Arc<HeadlessBackend>, LinearAllocator) {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = LinearAllocator::with_page_size(backend.clone(), page_size);
        (backend, allocator)
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_offset(100, 256), 256);
        assert_eq!(align_offset(256, 256), 256);
        assert_eq!(align_offset(257, 256), 512);
        assert_eq!(align_offset(0, 1), 0);
    }

    #[test]
    fn test_first_fit_is_contiguous() {
        let (_backend, allocator) = allocator(1024);
        let a = allocator.alloc(100, 4, MemoryKind::Vertex).unwrap();
        let b = allocator.alloc(100, 4, MemoryKind::Vertex).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 100);
        assert_eq!(a.page_id(), b.page_id());
        assert_eq!(a.memory(), b.memory());
    }

    #[test]
    fn test_alignment_padding_stays_free() {
        let (_backend, allocator) = allocator(1024);
        let _a = allocator.alloc(10, 1, MemoryKind::Uniform).unwrap();
        let b = allocator.alloc(64, 256, MemoryKind::Uniform).unwrap();
        assert_eq!(b.offset(), 256);

        let page = &allocator.pages()[0];
        assert_eq!(page.free_blocks, vec![(10, 246), (320, 704)]);

        // Padding is reusable by a small request
        let c = allocator.alloc(16, 1, MemoryKind::Uniform).unwrap();
        assert_eq!(c.offset(), 10);
    }

    #[test]
    fn test_kinds_never_share_pages() {
        let (backend, allocator) = allocator(1024);
        let vertex = allocator.alloc(16, 1, MemoryKind::Vertex).unwrap();
        let index = allocator.alloc(16, 1, MemoryKind::Index).unwrap();
        assert_ne!(vertex.page_id(), index.page_id());
        assert_eq!(backend.live_memory_blocks(), 2);
    }

    #[test]
    fn test_oversized_request_gets_own_page() {
        let (backend, allocator) = allocator(1024);
        let big = allocator.alloc(4096, 16, MemoryKind::Storage).unwrap();
        assert_eq!(big.offset(), 0);
        assert_eq!(allocator.pages()[0].capacity, 4096);
        drop(big);
        assert_eq!(backend.live_memory_blocks(), 0);
    }

    #[test]
    fn test_page_returned_when_empty() {
        let (backend, allocator) = allocator(1024);
        let a = allocator.alloc(512, 1, MemoryKind::Vertex).unwrap();
        let b = allocator.alloc(512, 1, MemoryKind::Vertex).unwrap();
        let c = allocator.alloc(1, 1, MemoryKind::Vertex).unwrap();
        assert_eq!(allocator.page_count(), 2);
        assert_ne!(c.page_id(), a.page_id());

        drop(c);
        assert_eq!(allocator.page_count(), 1);
        allocator.free(a);
        allocator.free(b);
        assert_eq!(allocator.page_count(), 0);
        assert_eq!(backend.memory_in_use(), 0);

        let stats = allocator.stats();
        assert_eq!(stats.pages_created, 2);
        assert_eq!(stats.pages_released, 2);
        assert_eq!(stats.peak_bytes_in_use, 1025);
        assert_eq!(stats.bytes_in_use, 0);
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let (_backend, allocator) = allocator(1024);
        let a = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();
        let b = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();
        let c = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();
        let _d = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();

        drop(b);
        assert_eq!(allocator.pages()[0].free_blocks, vec![(100, 100), (400, 624)]);
        drop(a);
        assert_eq!(allocator.pages()[0].free_blocks, vec![(0, 200), (400, 624)]);
        drop(c);
        assert_eq!(allocator.pages()[0].free_blocks, vec![(0, 300), (400, 624)]);
    }

    #[test]
    fn test_invalid_arguments() {
        let (backend, allocator) = allocator(1024);
        let zero = allocator.alloc(0, 1, MemoryKind::Vertex).unwrap_err();
        assert!(zero.is_programmer_error());
        let align = allocator.alloc(16, 3, MemoryKind::Vertex).unwrap_err();
        assert!(align.is_programmer_error());
        assert!(allocator.alloc(16, 0, MemoryKind::Vertex).is_err());
        assert_eq!(backend.live_memory_blocks(), 0);
    }

    #[test]
    fn test_provider_refusal_is_out_of_memory() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            memory_budget: Some(1024),
            ..Default::default()
        }));
        let allocator = LinearAllocator::with_page_size(backend, 1024);
        let _a = allocator.alloc(1024, 1, MemoryKind::Vertex).unwrap();
        let err = allocator.alloc(1, 1, MemoryKind::Vertex).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(allocator.stats().failed_allocations, 1);
    }

    #[test]
    fn test_fragmentation() {
        let (_backend, allocator) = allocator(1000);
        assert_eq!(allocator.fragmentation(), 0.0);
        let a = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();
        let _b = allocator.alloc(100, 1, MemoryKind::Vertex).unwrap();
        assert_eq!(allocator.fragmentation(), 0.0);
        drop(a);
        // free blocks of 100 and 800
        let fragmentation = allocator.fragmentation();
        assert!((fragmentation - 100.0 / 900.0).abs() < 1e-6);
    }

    #[test]
    fn test_allocation_range_offset() {
        let (_backend, allocator) = allocator(1024);
        let _pad = allocator.alloc(8, 1, MemoryKind::Staging).unwrap();
        let a = allocator.alloc(64, 1, MemoryKind::Staging).unwrap();
        assert_eq!(a.range_offset(0, 64), Some(8));
        assert_eq!(a.range_offset(60, 4), Some(68));
        assert_eq!(a.range_offset(60, 5), None);
        assert_eq!(a.range_offset(u64::MAX, 1), None);
    }

    #[test]
    fn test_huge_request_fails_without_overflow() {
        let (backend, allocator) = allocator(1024);
        let small = allocator.alloc(16, 1, MemoryKind::Vertex).unwrap();

        let err = allocator.alloc(u64::MAX - 8, 1, MemoryKind::Vertex).unwrap_err();
        assert!(err.is_out_of_memory());

        let stats = allocator.stats();
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.allocations, 1);
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(backend.live_memory_blocks(), 1);
        assert_eq!(small.offset(), 0);
    }
}
