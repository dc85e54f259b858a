//! Tessera - GPU resource allocation and lifetime layer
//!
//! Tessera sits between a renderer and its graphics backend. It sub-allocates
//! device memory, packs texture atlases with shared placements, pipelines
//! uploads and paces frames, recovering from device loss without disturbing
//! live allocations.

pub use tessera_core;
pub use tessera_renderer;

pub use tessera_renderer::{RenderDevice, RenderDeviceBuilder};

/// Unified prelude module that exports all commonly used types
pub mod prelude {
    pub use tessera_core::prelude::*;
    pub use tessera_renderer::{
        AtlasAllocation, AtlasCache, Backend, FrameStatus, HeadlessBackend, ImageLayout,
        LinearAllocation, LinearAllocator, MemoryKind, MemoryProvider, RectAllocator,
        RenderDevice, RenderDeviceBuilder, UploadEngine,
    };
}

/// Initialize logging and validate the configuration for every layer
pub fn init(config: &tessera_core::TesseraConfig) -> anyhow::Result<()> {
    tessera_core::init(config)?;
    tessera_renderer::init(config)?;
    tracing::debug!("Tessera v{} ready", VERSION);
    Ok(())
}

/// Load a JSON configuration file and initialize with it
pub fn init_from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<tessera_core::TesseraConfig> {
    let path = path.as_ref();
    let config = tessera_core::TesseraConfig::load(path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path.display(), e))?;
    init(&config)?;
    Ok(config)
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
