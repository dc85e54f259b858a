//! Tessera Renderer
//!
//! GPU resource allocation and lifetime layer, independent of any one graphics API.
//!
//! ## Features
//! - Linear sub-allocation of device memory pages with neighbour coalescing
//! - Guillotine atlas packing with shared, reference-counted placements
//! - Double-buffered upload pipeline bounded to two batches in flight
//! - Frame pacing with device-loss and outdated-surface recovery
//! - A CPU reference backend, and a wgpu backend behind the `wgpu` feature

pub mod atlas;
pub mod backend;
pub mod device;
pub mod frame;
pub mod memory;
pub mod upload;

// Re-export commonly used types
pub use atlas::{AtlasAllocation, AtlasCache, AtlasStats, RectAllocator};
pub use backend::{
    Backend, Command, HeadlessBackend, HeadlessConfig, ImageLayout, MemoryKind, MemoryProvider,
};
pub use device::{RenderDevice, RenderDeviceBuilder};
pub use frame::{FrameRecorder, FrameStats, FrameStatus, FrameSynchronizer};
pub use memory::{LinearAllocation, LinearAllocator, LinearStats};
pub use upload::{Data, DataStream, StreamState, UploadEngine, UploadStats};

#[cfg(feature = "wgpu")]
pub use backend::WgpuBackend;

use tessera_core::{Result, TesseraConfig};

/// Initialize the renderer layer
pub fn init(config: &TesseraConfig) -> Result<()> {
    config.validate()?;
    tracing::info!(
        "Initializing Tessera renderer: {} byte linear pages, {}px atlas pages, {} frames in flight",
        config.memory.default_page_size,
        config.atlas.default_page_size,
        config.frame.max_frames_in_flight
    );
    Ok(())
}
