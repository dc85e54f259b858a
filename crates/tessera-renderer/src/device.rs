//! Top-level owner of the allocators, the upload ring and the frame slots

use crate::atlas::{AtlasCache, RectAllocator};
use crate::backend::{Backend, SharedBackend, SharedProvider};
use crate::frame::{FrameRecorder, FrameStatus, FrameSynchronizer};
use crate::memory::LinearAllocator;
use crate::upload::{Data, UploadEngine};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::logging::LogCategory;
use tessera_core::{tessera_error, tessera_info, Result, TesseraConfig};

/// Resource layer of one backend device.
///
/// Owns the linear and atlas allocators, the upload engine and the frame
/// synchronizer for the lifetime of the device. Dropping it waits for all
/// outstanding GPU work.
pub struct RenderDevice {
    frames: FrameSynchronizer,
    upload: UploadEngine,
    atlas: RectAllocator,
    linear: LinearAllocator,
    backend: SharedBackend,
    config: TesseraConfig,
}

impl RenderDevice {
    pub fn new<B: Backend + 'static>(backend: Arc<B>, config: &TesseraConfig) -> Result<Self> {
        config.validate()?;

        let provider: SharedProvider = backend.clone();
        let backend: SharedBackend = backend;

        let linear = LinearAllocator::new(provider.clone(), &config.memory);
        let atlas = RectAllocator::new(provider, &config.atlas);
        let upload = UploadEngine::new(backend.clone(), linear.clone())?;
        let frames = FrameSynchronizer::new(backend.clone(), &config.frame)?;

        tessera_info!(
            LogCategory::Core,
            "Render device on {} backend: {} frames in flight",
            backend.name(),
            config.frame.max_frames_in_flight
        );

        Ok(Self {
            frames,
            upload,
            atlas,
            linear,
            backend,
            config: config.clone(),
        })
    }

    pub fn builder() -> RenderDeviceBuilder {
        RenderDeviceBuilder::new()
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn linear(&self) -> &LinearAllocator {
        &self.linear
    }

    pub fn atlas(&self) -> &RectAllocator {
        &self.atlas
    }

    /// Content-keyed cache over this device's atlas
    pub fn atlas_cache<K: Hash + Eq>(&self) -> AtlasCache<K> {
        AtlasCache::new(self.atlas.clone())
    }

    pub fn upload(&self) -> &UploadEngine {
        &self.upload
    }

    /// Shorthand for `upload().get()`
    pub fn upload_stream(&self) -> Result<Data<'_>> {
        self.upload.get()
    }

    pub fn frames(&self) -> &FrameSynchronizer {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameSynchronizer {
        &mut self.frames
    }

    pub fn render_frame<F>(&mut self, record: F) -> Result<FrameStatus>
    where
        F: FnOnce(&mut FrameRecorder<'_>) -> Result<()>,
    {
        self.frames.render_frame(record)
    }

    /// Retire every upload batch and every frame in flight
    pub fn wait_idle(&mut self) -> Result<()> {
        self.upload.wait_idle()?;
        self.frames.wait_idle()
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            tessera_error!(
                LogCategory::Core,
                "Render device shutdown with work in flight: {}",
                err.format_for_log()
            );
        }
    }
}

impl fmt::Debug for RenderDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderDevice")
            .field("backend", &self.backend.name())
            .field("linear", &self.linear)
            .field("atlas", &self.atlas)
            .field("upload", &self.upload)
            .field("frames", &self.frames)
            .finish()
    }
}

/// Builder for a [`RenderDevice`] with a custom configuration
#[derive(Debug, Clone, Default)]
pub struct RenderDeviceBuilder {
    config: TesseraConfig,
}

impl RenderDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration
    pub fn with_config(mut self, config: TesseraConfig) -> Self {
        self.config = config;
        self
    }

    /// Size of every linear page, unless a single request is larger
    pub fn with_linear_page_size(mut self, bytes: u64) -> Self {
        self.config.memory.default_page_size = bytes;
        self
    }

    /// Edge length of every atlas page, unless a single request is larger
    pub fn with_atlas_page_size(mut self, size: u32) -> Self {
        self.config.atlas.default_page_size = size;
        self
    }

    pub fn with_retained_empty_pages(mut self, pages: usize) -> Self {
        self.config.atlas.retained_empty_pages = pages;
        self
    }

    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.config.frame.max_frames_in_flight = frames;
        self
    }

    pub fn with_device_loss_timeout(mut self, timeout: Duration) -> Self {
        self.config.frame.device_loss_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build<B: Backend + 'static>(self, backend: Arc<B>) -> Result<RenderDevice> {
        RenderDevice::new(backend, &self.config)
    }
}
