//! Texture atlas packing
//!
//! Every atlas page is one backend surface carrying a guillotine tree. Nodes
//! live in a slot arena and link to their owner and up to three children;
//! a node with a positive reference count is a placement and is never split.
//! Placements are shared through [`AtlasAllocation`] clones, and the tree is
//! pruned back upwards when the last handle to a node goes away.

use crate::backend::{SharedProvider, SurfaceHandle};
use glam::UVec2;
use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tessera_core::logging::LogCategory;
use tessera_core::{tessera_debug, AtlasConfig, ErrorContext, Region, Result, TesseraError};
use tracing::{debug, instrument, warn};

slotmap::new_key_type! {
    /// Identifies one atlas page for as long as it is resident
    pub struct AtlasPageId;
    /// Identifies one node of a page tree
    pub struct NodeId;
}

struct Node {
    region: Region,
    owner: Option<NodeId>,
    sub: SmallVec<[NodeId; 3]>,
    refcount: u32,
    /// Serial of the placement currently held in this node
    epoch: u64,
    page: AtlasPageId,
}

impl Node {
    fn new(region: Region, owner: Option<NodeId>, page: AtlasPageId) -> Self {
        Self {
            region,
            owner,
            sub: SmallVec::new(),
            refcount: 0,
            epoch: 0,
            page,
        }
    }

    fn is_free_leaf(&self) -> bool {
        self.refcount == 0 && self.sub.is_empty()
    }
}

struct AtlasPage {
    surface: SurfaceHandle,
    width: u32,
    height: u32,
    root: NodeId,
}

/// Children of a free leaf `region` receiving a `width × height` request.
/// The request-sized child always comes first.
fn split(region: Region, width: u32, height: u32) -> SmallVec<[Region; 3]> {
    let Region { x, y, .. } = region;
    let (w, h) = (region.width, region.height);
    let leaf = Region::new(x, y, width, height);

    if width == w {
        return smallvec![leaf, Region::new(x, y + height, w, h - height)];
    }
    if height == h {
        return smallvec![leaf, Region::new(x + width, y, w - width, h)];
    }

    let horizontal = [
        Region::new(x + width, y, w - width, height),
        Region::new(x, y + height, w, h - height),
    ];
    let vertical = [
        Region::new(x + width, y, w - width, h),
        Region::new(x, y + height, width, h - height),
    ];
    let largest = |parts: &[Region; 2]| parts.iter().map(Region::area).max().unwrap_or(0);

    let [right, bottom] = if largest(&vertical) > largest(&horizontal) {
        vertical
    } else {
        horizontal
    };
    smallvec![leaf, right, bottom]
}

/// Atlas packer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtlasStats {
    pub pages: usize,
    /// Sum of resident page areas
    pub page_pixels: u64,
    /// Area covered by live placements
    pub pixels_in_use: u64,
    pub peak_pixels_in_use: u64,
    /// Nodes with a positive reference count
    pub placements: usize,
    /// Sum of all reference counts
    pub handles: u64,
    pub nodes: usize,
    pub total_allocations: u64,
    pub failed_allocations: u64,
    pub pages_created: u64,
    pub pages_released: u64,
}

/// One leaf of a page tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLeaf {
    pub region: Region,
    pub refcount: u32,
}

/// Snapshot of one resident page
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasPageInfo {
    pub id: AtlasPageId,
    pub surface: SurfaceHandle,
    pub width: u32,
    pub height: u32,
    /// Leaves in depth-first `sub[]` order. Together they tile the page.
    pub leaves: Vec<AtlasLeaf>,
}

struct AtlasState {
    nodes: SlotMap<NodeId, Node>,
    pages: SlotMap<AtlasPageId, AtlasPage>,
    /// Pages in creation order, the first-fit search order
    order: Vec<AtlasPageId>,
    next_epoch: u64,
    stats: AtlasStats,
}

impl AtlasState {
    fn place(&mut self, id: NodeId, width: u32, height: u32) -> Option<NodeId> {
        let node = &self.nodes[id];
        if !node.region.fits(width, height) {
            return None;
        }
        if node.refcount > 0 || !node.sub.is_empty() {
            let sub = node.sub.clone();
            return sub
                .into_iter()
                .find_map(|child| self.place(child, width, height));
        }

        let region = node.region;
        let page = node.page;
        if region.width == width && region.height == height {
            self.occupy(id);
            return Some(id);
        }

        let children: SmallVec<[NodeId; 3]> = split(region, width, height)
            .into_iter()
            .map(|part| self.nodes.insert(Node::new(part, Some(id), page)))
            .collect();
        let leaf = children[0];
        self.nodes[id].sub = children;
        self.place(leaf, width, height)
    }

    /// Turn a free leaf into a placement
    fn occupy(&mut self, id: NodeId) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let node = &mut self.nodes[id];
        node.refcount = 1;
        node.epoch = epoch;
        let area = node.region.area();

        let stats = &mut self.stats;
        stats.pixels_in_use += area;
        stats.peak_pixels_in_use = stats.peak_pixels_in_use.max(stats.pixels_in_use);
        stats.placements += 1;
        stats.handles += 1;
    }

    /// Drop one reference. Returns the page if the node became free.
    fn unref(&mut self, id: NodeId) -> Option<AtlasPageId> {
        let Some(node) = self.nodes.get_mut(id) else {
            warn!("release of unknown atlas node {:?}", id);
            return None;
        };
        node.refcount -= 1;
        self.stats.handles -= 1;
        if node.refcount > 0 {
            return None;
        }

        let area = node.region.area();
        let page = node.page;
        let mut current = node.owner;
        self.stats.pixels_in_use -= area;
        self.stats.placements -= 1;

        while let Some(parent) = current {
            let owner = &self.nodes[parent];
            let collapsible = owner.refcount == 0
                && owner
                    .sub
                    .iter()
                    .all(|child| self.nodes[*child].is_free_leaf());
            if !collapsible {
                break;
            }
            let sub = std::mem::take(&mut self.nodes[parent].sub);
            for child in sub {
                self.nodes.remove(child);
            }
            current = self.nodes[parent].owner;
        }
        Some(page)
    }

    fn is_page_empty(&self, page: AtlasPageId) -> bool {
        self.pages
            .get(page)
            .map_or(false, |p| self.nodes[p.root].is_free_leaf())
    }

    fn collect_leaves(&self, id: NodeId, leaves: &mut Vec<AtlasLeaf>) {
        let node = &self.nodes[id];
        if node.sub.is_empty() {
            leaves.push(AtlasLeaf {
                region: node.region,
                refcount: node.refcount,
            });
        }
        for child in &node.sub {
            self.collect_leaves(*child, leaves);
        }
    }
}

struct AtlasShared {
    provider: SharedProvider,
    default_page_size: u32,
    retained_empty_pages: usize,
    state: Mutex<AtlasState>,
}

impl AtlasShared {
    fn handle(self: &Arc<Self>, state: &AtlasState, node: NodeId) -> AtlasAllocation {
        let node_ref = &state.nodes[node];
        let page = &state.pages[node_ref.page];
        AtlasAllocation {
            shared: self.clone(),
            page: node_ref.page,
            node,
            epoch: node_ref.epoch,
            region: node_ref.region,
            surface: page.surface,
            page_size: UVec2::new(page.width, page.height),
        }
    }

    fn retain(&self, node: NodeId) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(node) {
            node.refcount += 1;
            state.stats.handles += 1;
        }
    }

    fn release(&self, node: NodeId) {
        let mut state = self.state.lock();
        let Some(page) = state.unref(node) else {
            return;
        };
        if !state.is_page_empty(page) {
            return;
        }

        let empty_pages = state
            .order
            .iter()
            .filter(|id| state.is_page_empty(**id))
            .count();
        if empty_pages <= self.retained_empty_pages {
            debug!("keeping empty atlas page {:?} resident", page);
            return;
        }

        self.release_page(&mut state, page);
    }

    fn release_page(&self, state: &mut AtlasState, page: AtlasPageId) {
        let Some(removed) = state.pages.remove(page) else {
            return;
        };
        state.nodes.remove(removed.root);
        state.order.retain(|id| *id != page);
        self.provider
            .free_surface(removed.surface, removed.width, removed.height);

        let stats = &mut state.stats;
        stats.pages -= 1;
        stats.page_pixels -= removed.width as u64 * removed.height as u64;
        stats.pages_released += 1;
        tessera_debug!(
            LogCategory::Atlas,
            "Released atlas page {}x{}",
            removed.width,
            removed.height
        );
    }

    /// Take another reference on `node` if it still holds placement `epoch`
    fn revive(self: &Arc<Self>, node: NodeId, epoch: u64) -> Option<AtlasAllocation> {
        let mut state = self.state.lock();
        let live = state
            .nodes
            .get(node)
            .map_or(false, |n| n.refcount > 0 && n.epoch == epoch);
        if !live {
            return None;
        }
        state.nodes[node].refcount += 1;
        state.stats.handles += 1;
        Some(self.handle(&state, node))
    }
}

impl Drop for AtlasShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, page) in state.pages.drain() {
            self.provider
                .free_surface(page.surface, page.width, page.height);
        }
    }
}

/// Guillotine atlas packer over provider surfaces
#[derive(Clone)]
pub struct RectAllocator {
    shared: Arc<AtlasShared>,
}

impl RectAllocator {
    pub fn new(provider: SharedProvider, config: &AtlasConfig) -> Self {
        Self::with_page_size(
            provider,
            config.default_page_size,
            config.retained_empty_pages,
        )
    }

    pub fn with_page_size(
        provider: SharedProvider,
        default_page_size: u32,
        retained_empty_pages: usize,
    ) -> Self {
        Self {
            shared: Arc::new(AtlasShared {
                provider,
                default_page_size: default_page_size.max(1),
                retained_empty_pages,
                state: Mutex::new(AtlasState {
                    nodes: SlotMap::with_key(),
                    pages: SlotMap::with_key(),
                    order: Vec::new(),
                    next_epoch: 1,
                    stats: AtlasStats::default(),
                }),
            }),
        }
    }

    pub fn default_page_size(&self) -> u32 {
        self.shared.default_page_size
    }

    /// Place a `width × height` region, growing a new page when nothing fits
    #[instrument(skip(self), level = "trace")]
    pub fn alloc(&self, width: u32, height: u32) -> Result<AtlasAllocation> {
        if width == 0 || height == 0 {
            return Err(TesseraError::invalid_argument_with_context(
                format!("empty atlas request {}x{}", width, height),
                ErrorContext::new("alloc", "RectAllocator"),
            ));
        }

        let mut state = self.shared.state.lock();

        let roots: Vec<NodeId> = state
            .order
            .iter()
            .map(|page| state.pages[*page].root)
            .collect();
        for root in roots {
            if let Some(node) = state.place(root, width, height) {
                state.stats.total_allocations += 1;
                return Ok(self.shared.handle(&state, node));
            }
        }

        let root = self.create_page(&mut state, width, height)?;
        let node = state.place(root, width, height).ok_or_else(|| {
            TesseraError::out_of_memory(format!(
                "fresh atlas page cannot hold {}x{}",
                width, height
            ))
        })?;
        state.stats.total_allocations += 1;
        Ok(self.shared.handle(&state, node))
    }

    fn create_page(&self, state: &mut AtlasState, width: u32, height: u32) -> Result<NodeId> {
        let page_width = self.shared.default_page_size.max(width);
        let page_height = self.shared.default_page_size.max(height);

        let Some(surface) = self.shared.provider.alloc_surface(page_width, page_height) else {
            state.stats.failed_allocations += 1;
            return Err(TesseraError::out_of_memory_with_context(
                format!("provider refused a {}x{} atlas page", page_width, page_height),
                ErrorContext::new("create_page", "RectAllocator")
                    .with_metadata("request", format!("{}x{}", width, height))
                    .with_metadata("resident_pages", state.pages.len()),
            ));
        };

        let page = state.pages.insert(AtlasPage {
            surface,
            width: page_width,
            height: page_height,
            root: NodeId::default(),
        });
        let root = state.nodes.insert(Node::new(
            Region::with_size(page_width, page_height),
            None,
            page,
        ));
        state.pages[page].root = root;
        state.order.push(page);

        let stats = &mut state.stats;
        stats.pages += 1;
        stats.page_pixels += page_width as u64 * page_height as u64;
        stats.pages_created += 1;
        tessera_debug!(
            LogCategory::Atlas,
            "New atlas page {}x{} for a {}x{} request",
            page_width,
            page_height,
            width,
            height
        );
        Ok(root)
    }

    pub fn stats(&self) -> AtlasStats {
        let state = self.shared.state.lock();
        AtlasStats {
            nodes: state.nodes.len(),
            ..state.stats.clone()
        }
    }

    pub fn page_count(&self) -> usize {
        self.shared.state.lock().pages.len()
    }

    /// Snapshot every resident page in search order
    pub fn pages(&self) -> Vec<AtlasPageInfo> {
        let state = self.shared.state.lock();
        state
            .order
            .iter()
            .map(|id| {
                let page = &state.pages[*id];
                let mut leaves = Vec::new();
                state.collect_leaves(page.root, &mut leaves);
                AtlasPageInfo {
                    id: *id,
                    surface: page.surface,
                    width: page.width,
                    height: page.height,
                    leaves,
                }
            })
            .collect()
    }
}

impl fmt::Debug for RectAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RectAllocator")
            .field("default_page_size", &self.shared.default_page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Shared handle to one atlas placement.
///
/// Cloning takes another reference on the node; the region is released when
/// the last handle drops.
pub struct AtlasAllocation {
    shared: Arc<AtlasShared>,
    page: AtlasPageId,
    node: NodeId,
    epoch: u64,
    region: Region,
    surface: SurfaceHandle,
    page_size: UVec2,
}

impl AtlasAllocation {
    /// Top-left corner inside the page, in texels
    pub fn pos(&self) -> UVec2 {
        self.region.pos()
    }

    pub fn size(&self) -> UVec2 {
        self.region.size()
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn page_id(&self) -> AtlasPageId {
        self.page
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Backing surface of the page
    pub fn memory(&self) -> SurfaceHandle {
        self.surface
    }

    pub fn page_size(&self) -> UVec2 {
        self.page_size
    }

    /// Normalized texture coordinates `(u_min, v_min, u_max, v_max)`
    pub fn uv_rect(&self) -> (f32, f32, f32, f32) {
        self.region.uv_rect(self.page_size.x, self.page_size.y)
    }

    /// Current number of handles sharing this placement
    pub fn ref_count(&self) -> u32 {
        let state = self.shared.state.lock();
        state.nodes.get(self.node).map_or(0, |n| n.refcount)
    }

    /// Whether both handles refer to the same placement
    pub fn same_placement(&self, other: &AtlasAllocation) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
            && self.node == other.node
            && self.epoch == other.epoch
    }
}

impl Clone for AtlasAllocation {
    fn clone(&self) -> Self {
        self.shared.retain(self.node);
        Self {
            shared: self.shared.clone(),
            page: self.page,
            node: self.node,
            epoch: self.epoch,
            region: self.region,
            surface: self.surface,
            page_size: self.page_size,
        }
    }
}

impl Drop for AtlasAllocation {
    fn drop(&mut self) {
        self.shared.release(self.node);
    }
}

impl fmt::Debug for AtlasAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasAllocation")
            .field("page", &self.page)
            .field("region", &self.region)
            .finish()
    }
}

struct CacheEntry {
    node: NodeId,
    epoch: u64,
    region: Region,
}

/// Content-keyed placement cache.
///
/// Identical keys share one placement while at least one handle to it is alive.
/// Entries hold no reference themselves, so the cache never keeps a region
/// resident.
pub struct AtlasCache<K> {
    allocator: RectAllocator,
    entries: HashMap<K, CacheEntry>,
}

impl<K: Hash + Eq> AtlasCache<K> {
    pub fn new(allocator: RectAllocator) -> Self {
        Self {
            allocator,
            entries: HashMap::new(),
        }
    }

    pub fn allocator(&self) -> &RectAllocator {
        &self.allocator
    }

    /// Live placement for `key`, or a fresh `width × height` one. The flag is
    /// `true` when the region was newly placed and its content must be uploaded.
    pub fn get_or_alloc(&mut self, key: K, width: u32, height: u32) -> Result<(AtlasAllocation, bool)> {
        if let Some(entry) = self.entries.get(&key) {
            if entry.region.width == width && entry.region.height == height {
                if let Some(allocation) = self.allocator.shared.revive(entry.node, entry.epoch) {
                    return Ok((allocation, false));
                }
            }
        }

        let allocation = self.allocator.alloc(width, height)?;
        self.entries.insert(
            key,
            CacheEntry {
                node: allocation.node,
                epoch: allocation.epoch,
                region: allocation.region,
            },
        );
        Ok((allocation, true))
    }

    /// Drop entries whose placement is gone. Returns how many were removed.
    pub fn purge(&mut self) -> usize {
        let before = self.entries.len();
        let state = self.allocator.shared.state.lock();
        self.entries.retain(|_, entry| {
            state
                .nodes
                .get(entry.node)
                .map_or(false, |n| n.refcount > 0 && n.epoch == entry.epoch)
        });
        before - self.entries.len()
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, HeadlessConfig};
    use pretty_assertions::assert_eq;

    fn allocator(page_size: u32, retained: usize) -> (Arc<HeadlessBackend>, RectAllocator) {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = RectAllocator::with_page_size(backend.clone(), page_size, retained);
        (backend, allocator)
    }

    fn leaves(allocator: &RectAllocator) -> Vec<AtlasLeaf> {
        allocator.pages()[0].leaves.clone()
    }

    #[test]
    fn test_vertical_cut_for_tall_request() {
        let (_backend, allocator) = allocator(100, 1);
        let a = allocator.alloc(30, 60).unwrap();
        assert_eq!(a.region(), Region::new(0, 0, 30, 60));
        assert_eq!(
            leaves(&allocator),
            vec![
                AtlasLeaf { region: Region::new(0, 0, 30, 60), refcount: 1 },
                AtlasLeaf { region: Region::new(30, 0, 70, 100), refcount: 0 },
                AtlasLeaf { region: Region::new(0, 60, 30, 40), refcount: 0 },
            ]
        );
    }

    #[test]
    fn test_horizontal_cut_for_wide_request() {
        let (_backend, allocator) = allocator(100, 1);
        let _a = allocator.alloc(60, 30).unwrap();
        assert_eq!(
            leaves(&allocator),
            vec![
                AtlasLeaf { region: Region::new(0, 0, 60, 30), refcount: 1 },
                AtlasLeaf { region: Region::new(60, 0, 40, 30), refcount: 0 },
                AtlasLeaf { region: Region::new(0, 30, 100, 70), refcount: 0 },
            ]
        );
    }

    #[test]
    fn test_tie_prefers_horizontal() {
        assert_eq!(
            split(Region::with_size(100, 100), 50, 50).as_slice(),
            &[
                Region::new(0, 0, 50, 50),
                Region::new(50, 0, 50, 50),
                Region::new(0, 50, 100, 50),
            ]
        );
    }

    #[test]
    fn test_single_dimension_match_splits_in_two() {
        assert_eq!(
            split(Region::with_size(64, 64), 64, 16).as_slice(),
            &[Region::new(0, 0, 64, 16), Region::new(0, 16, 64, 48)]
        );
        assert_eq!(
            split(Region::with_size(64, 64), 16, 64).as_slice(),
            &[Region::new(0, 0, 16, 64), Region::new(16, 0, 48, 64)]
        );
    }

    #[test]
    fn test_used_nodes_are_never_split() {
        let (_backend, allocator) = allocator(64, 1);
        let whole = allocator.alloc(64, 64).unwrap();
        assert_eq!(whole.region(), Region::with_size(64, 64));
        let other = allocator.alloc(8, 8).unwrap();
        assert_ne!(other.page_id(), whole.page_id());
        assert_eq!(allocator.page_count(), 2);
    }

    #[test]
    fn test_release_prunes_to_bare_root() {
        let (backend, allocator) = allocator(128, 1);
        let a = allocator.alloc(32, 32).unwrap();
        let b = allocator.alloc(32, 32).unwrap();
        assert!(!a.region().intersects(&b.region()));

        drop(a);
        assert!(allocator.stats().nodes > 1);
        drop(b);

        let stats = allocator.stats();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.placements, 0);
        assert_eq!(stats.pixels_in_use, 0);
        assert_eq!(
            leaves(&allocator),
            vec![AtlasLeaf { region: Region::with_size(128, 128), refcount: 0 }]
        );
        // retained empty page
        assert_eq!(backend.live_surfaces(), 1);
    }

    #[test]
    fn test_freed_leaf_is_reused() {
        let (_backend, allocator) = allocator(128, 1);
        let a = allocator.alloc(32, 32).unwrap();
        let _b = allocator.alloc(32, 32).unwrap();
        let region = a.region();
        drop(a);
        let c = allocator.alloc(32, 32).unwrap();
        assert_eq!(c.region(), region);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let (_backend, allocator) = allocator(256, 1);
        let a = allocator.alloc(64, 64).unwrap();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        assert!(a.same_placement(&b));

        drop(a);
        assert_eq!(b.ref_count(), 1);
        drop(b);

        let again = allocator.alloc(64, 64).unwrap();
        assert_eq!(again.pos(), UVec2::ZERO);
        assert_eq!(allocator.stats().pages_created, 1);
    }

    #[test]
    fn test_empty_pages_beyond_retention_are_released() {
        let (backend, allocator) = allocator(64, 1);
        let a = allocator.alloc(64, 64).unwrap();
        let b = allocator.alloc(64, 64).unwrap();
        assert_eq!(backend.live_surfaces(), 2);

        drop(a);
        assert_eq!(backend.live_surfaces(), 2);
        drop(b);
        assert_eq!(backend.live_surfaces(), 1);
        assert_eq!(allocator.stats().pages_released, 1);
    }

    #[test]
    fn test_no_retention_releases_every_page() {
        let (backend, allocator) = allocator(64, 0);
        let a = allocator.alloc(16, 16).unwrap();
        drop(a);
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(allocator.stats().nodes, 0);
    }

    #[test]
    fn test_oversized_request_grows_page() {
        let (_backend, allocator) = allocator(64, 1);
        let big = allocator.alloc(100, 20).unwrap();
        assert_eq!(big.page_size(), UVec2::new(100, 64));
        assert_eq!(big.uv_rect(), (0.0, 0.0, 1.0, 20.0 / 64.0));
    }

    #[test]
    fn test_invalid_and_out_of_memory() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            max_surfaces: Some(1),
            ..Default::default()
        }));
        let allocator = RectAllocator::with_page_size(backend, 32, 1);
        assert!(allocator.alloc(0, 4).unwrap_err().is_programmer_error());

        let _full = allocator.alloc(32, 32).unwrap();
        let err = allocator.alloc(4, 4).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(allocator.stats().failed_allocations, 1);
    }

    #[test]
    fn test_cache_shares_live_placements() {
        let (_backend, allocator) = allocator(256, 1);
        let mut cache = AtlasCache::new(allocator.clone());

        let (first, placed) = cache.get_or_alloc("icon", 16, 16).unwrap();
        assert!(placed);
        let (second, placed) = cache.get_or_alloc("icon", 16, 16).unwrap();
        assert!(!placed);
        assert!(first.same_placement(&second));
        assert_eq!(first.ref_count(), 2);

        drop(first);
        drop(second);
        assert_eq!(cache.purge(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_ignores_reused_node() {
        let (_backend, allocator) = allocator(256, 1);
        let mut cache = AtlasCache::new(allocator.clone());
        let _pin = allocator.alloc(16, 16).unwrap();

        let (old, _) = cache.get_or_alloc(1u32, 16, 16).unwrap();
        let _neighbour = allocator.alloc(16, 16).unwrap();
        let node = old.node_id();
        drop(old);

        // Same node, different content
        let squatter = allocator.alloc(16, 16).unwrap();
        assert_eq!(squatter.node_id(), node);

        let (fresh, placed) = cache.get_or_alloc(1u32, 16, 16).unwrap();
        assert!(placed);
        assert!(!fresh.same_placement(&squatter));
    }
}
