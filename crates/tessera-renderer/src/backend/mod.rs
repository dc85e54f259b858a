//! Provider contracts consumed by the allocators, the upload engine and the
//! frame synchronizer.
//!
//! Backends hand out opaque generational handles. Everything above this module
//! is backend-neutral: commands are recorded into [`Command`] lists and handed
//! to [`Backend::submit`], the way the painter hands draw lists to a renderer.

use std::sync::Arc;
use std::time::Duration;
use tessera_core::Result;

pub mod commands;
pub mod headless;
pub mod sync;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use commands::{Command, CopyTarget, ImageLayout};
pub use headless::{BackendEvent, HeadlessBackend, HeadlessConfig};
pub use sync::{Fence, Semaphore};
#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuBackend;

slotmap::new_key_type! {
    /// Opaque device-memory block
    pub struct MemoryHandle;
    /// Opaque 2-D surface used as atlas backing storage
    pub struct SurfaceHandle;
    /// CPU-visible completion fence
    pub struct FenceHandle;
    /// GPU-side ordering primitive between submissions and presentation
    pub struct SemaphoreHandle;
    /// Render target derived from one swapchain image
    pub struct FramebufferHandle;
}

/// Bytes per texel of every atlas surface (RGBA8)
pub const SURFACE_BYTES_PER_TEXEL: u32 = 4;

/// Memory type tag a page is allocated for. Pages are never shared between kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryKind {
    Vertex,
    Index,
    Uniform,
    Storage,
    /// Host-writable memory used as the source of transfers
    Staging,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 5] = [
        MemoryKind::Vertex,
        MemoryKind::Index,
        MemoryKind::Uniform,
        MemoryKind::Storage,
        MemoryKind::Staging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Vertex => "vertex",
            MemoryKind::Index => "index",
            MemoryKind::Uniform => "uniform",
            MemoryKind::Storage => "storage",
            MemoryKind::Staging => "staging",
        }
    }
}

/// Allocates and frees opaque device memory and atlas surfaces.
///
/// A `None` return is the null sentinel: the allocators turn it into
/// `TesseraError::OutOfMemory`. Every successful allocation is freed exactly
/// once, with the same size it was allocated with.
pub trait MemoryProvider: Send + Sync {
    fn alloc_memory(&self, size: u64, kind: MemoryKind) -> Option<MemoryHandle>;

    fn free_memory(&self, memory: MemoryHandle, size: u64, kind: MemoryKind);

    fn alloc_surface(&self, width: u32, height: u32) -> Option<SurfaceHandle>;

    fn free_surface(&self, surface: SurfaceHandle, width: u32, height: u32);

    /// Write host bytes into memory. Only valid for `MemoryKind::Staging` pages
    /// on backends without unified memory.
    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()>;
}

/// One queue submission
#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub commands: &'a [Command],
    /// Semaphore the GPU waits on before executing `commands`
    pub wait: Option<SemaphoreHandle>,
    /// Semaphore signaled once `commands` completed
    pub signal: Option<SemaphoreHandle>,
    /// Fence signaled once `commands` completed
    pub fence: Option<FenceHandle>,
}

impl<'a> SubmitInfo<'a> {
    pub fn new(commands: &'a [Command]) -> Self {
        Self {
            commands,
            wait: None,
            signal: None,
            fence: None,
        }
    }

    pub fn wait_on(mut self, semaphore: SemaphoreHandle) -> Self {
        self.wait = Some(semaphore);
        self
    }

    pub fn signal(mut self, semaphore: SemaphoreHandle) -> Self {
        self.signal = Some(semaphore);
        self
    }

    pub fn fence(mut self, fence: FenceHandle) -> Self {
        self.fence = Some(fence);
        self
    }
}

/// Queue, synchronization and presentation entry points of a graphics backend.
///
/// `DeviceLost` and `SurfaceOutdated` errors from `acquire_next_image`,
/// `submit` and `present` are recovered by the frame synchronizer; every other
/// error propagates to the caller.
pub trait Backend: MemoryProvider {
    /// Human readable backend name for logs
    fn name(&self) -> &str;

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle>;

    fn destroy_fence(&self, fence: FenceHandle);

    /// Block until `fence` is signaled. With `timeout == None` the wait is
    /// unbounded. Returns `Ok(false)` if the timeout elapsed first.
    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<bool>;

    fn fence_signaled(&self, fence: FenceHandle) -> bool;

    fn reset_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> Result<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn submit(&self, submission: &SubmitInfo<'_>) -> Result<()>;

    /// Acquire the next presentable image, signaling `signal` once it is ready
    fn acquire_next_image(&self, signal: SemaphoreHandle) -> Result<u32>;

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<()>;

    /// Give back an acquired image that will not be presented. `acquired` is
    /// the semaphore its acquisition signaled.
    fn release_image(&self, _image_index: u32, _acquired: SemaphoreHandle) {}

    /// Rebuild the swapchain after loss or resize. Returns the new image count.
    fn recreate_swapchain(&self) -> Result<u32>;

    fn image_count(&self) -> u32;

    fn create_framebuffer(&self, image_index: u32) -> Result<FramebufferHandle>;

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    /// Required alignment of `bytes_per_row` in buffer-to-surface copies
    fn copy_row_alignment(&self) -> u32 {
        1
    }

    /// Required alignment of offsets and sizes in buffer-to-buffer copies
    fn copy_buffer_alignment(&self) -> u64 {
        1
    }
}

/// Shared, type-erased backend as held by the upload engine and frame synchronizer
pub type SharedBackend = Arc<dyn Backend>;

/// Shared, type-erased memory provider as held by the allocators
pub type SharedProvider = Arc<dyn MemoryProvider>;
