//! wgpu implementation of the provider contracts
//!
//! Memory blocks are `wgpu::Buffer`s, atlas surfaces are RGBA8 textures and
//! fences are flags raised from `Queue::on_submitted_work_done`. wgpu orders
//! submissions on its single queue itself, so semaphores only carry bookkeeping
//! and layout transitions are no-ops.

use super::{
    Backend, Command, FenceHandle, FramebufferHandle, MemoryHandle, MemoryKind, MemoryProvider,
    SemaphoreHandle, SubmitInfo, SurfaceHandle,
};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::logging::LogCategory;
use tessera_core::{tessera_warn_rate_limited, Result, TesseraError};
use tracing::{debug, warn};

/// Buffer usages of every memory kind
fn buffer_usages(kind: MemoryKind) -> ::wgpu::BufferUsages {
    use ::wgpu::BufferUsages as U;
    match kind {
        MemoryKind::Vertex => U::VERTEX | U::COPY_DST,
        MemoryKind::Index => U::INDEX | U::COPY_DST,
        MemoryKind::Uniform => U::UNIFORM | U::COPY_DST,
        MemoryKind::Storage => U::STORAGE | U::COPY_DST | U::COPY_SRC,
        MemoryKind::Staging => U::COPY_SRC | U::COPY_DST,
    }
}

fn align_copy(size: u64) -> u64 {
    let alignment = ::wgpu::COPY_BUFFER_ALIGNMENT;
    (size + alignment - 1) / alignment * alignment
}

/// wgpu rejects buffer copies whose offsets or size are off the copy alignment
fn buffer_copy_is_valid(src_offset: u64, dst_offset: u64, size: u64) -> bool {
    let alignment = ::wgpu::COPY_BUFFER_ALIGNMENT;
    src_offset % alignment == 0 && dst_offset % alignment == 0 && size % alignment == 0
}

enum Target {
    Surface {
        surface: ::wgpu::Surface<'static>,
        config: ::wgpu::SurfaceConfiguration,
        acquired: Option<::wgpu::SurfaceTexture>,
    },
    Offscreen {
        texture: ::wgpu::Texture,
    },
}

#[derive(Default)]
struct WgpuState {
    buffers: SlotMap<MemoryHandle, ::wgpu::Buffer>,
    textures: SlotMap<SurfaceHandle, ::wgpu::Texture>,
    fences: SlotMap<FenceHandle, Arc<AtomicBool>>,
    semaphores: SlotMap<SemaphoreHandle, ()>,
    framebuffers: SlotMap<FramebufferHandle, u32>,
}

/// Backend over a wgpu device and queue, presenting to a surface or rendering
/// into an offscreen texture
pub struct WgpuBackend {
    device: Arc<::wgpu::Device>,
    queue: Arc<::wgpu::Queue>,
    target: Mutex<Target>,
    state: Mutex<WgpuState>,
    lost: Arc<AtomicBool>,
}

impl WgpuBackend {
    /// Present to `surface`, configured with `config`
    pub fn with_surface(
        device: Arc<::wgpu::Device>,
        queue: Arc<::wgpu::Queue>,
        surface: ::wgpu::Surface<'static>,
        config: ::wgpu::SurfaceConfiguration,
    ) -> Self {
        surface.configure(&device, &config);
        Self::from_parts(
            device,
            queue,
            Target::Surface {
                surface,
                config,
                acquired: None,
            },
        )
    }

    /// Render into a `width × height` offscreen color target
    pub fn offscreen(
        device: Arc<::wgpu::Device>,
        queue: Arc<::wgpu::Queue>,
        width: u32,
        height: u32,
    ) -> Self {
        let texture = device.create_texture(&::wgpu::TextureDescriptor {
            label: Some("tessera offscreen target"),
            size: ::wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: ::wgpu::TextureDimension::D2,
            format: ::wgpu::TextureFormat::Rgba8Unorm,
            usage: ::wgpu::TextureUsages::RENDER_ATTACHMENT | ::wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        Self::from_parts(device, queue, Target::Offscreen { texture })
    }

    fn from_parts(device: Arc<::wgpu::Device>, queue: Arc<::wgpu::Queue>, target: Target) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            warn!("wgpu device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::Release);
        });

        Self {
            device,
            queue,
            target: Mutex::new(target),
            state: Mutex::new(WgpuState::default()),
            lost,
        }
    }

    /// Reconfigure the surface for a new size. Takes effect on the next acquire.
    pub fn resize(&self, width: u32, height: u32) {
        if let Target::Surface { config, .. } = &mut *self.target.lock() {
            config.width = width.max(1);
            config.height = height.max(1);
        }
    }

    pub fn device(&self) -> &Arc<::wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<::wgpu::Queue> {
        &self.queue
    }

    fn check_device(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(TesseraError::device_lost("wgpu device lost"));
        }
        Ok(())
    }

    fn encode(
        &self,
        state: &WgpuState,
        target: &Target,
        encoder: &mut ::wgpu::CommandEncoder,
        command: &Command,
    ) {
        match *command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let (Some(src_buffer), Some(dst_buffer)) =
                    (state.buffers.get(src), state.buffers.get(dst))
                else {
                    warn!("copy between unknown buffers {:?} -> {:?}", src, dst);
                    return;
                };
                if !buffer_copy_is_valid(src_offset, dst_offset, size)
                    || src_offset.saturating_add(size) > src_buffer.size()
                    || dst_offset.saturating_add(size) > dst_buffer.size()
                {
                    warn!(
                        "invalid buffer copy of {} bytes ({} -> {}) skipped",
                        size, src_offset, dst_offset
                    );
                    return;
                }
                encoder.copy_buffer_to_buffer(src_buffer, src_offset, dst_buffer, dst_offset, size);
            }
            Command::CopyBufferToSurface {
                src,
                src_offset,
                bytes_per_row,
                dst,
                region,
            } => {
                let (Some(buffer), Some(texture)) = (state.buffers.get(src), state.textures.get(dst))
                else {
                    warn!("copy into unknown surface {:?}", dst);
                    return;
                };
                encoder.copy_buffer_to_texture(
                    ::wgpu::ImageCopyBuffer {
                        buffer,
                        layout: ::wgpu::ImageDataLayout {
                            offset: src_offset,
                            bytes_per_row: Some(bytes_per_row),
                            rows_per_image: Some(region.height),
                        },
                    },
                    ::wgpu::ImageCopyTexture {
                        texture,
                        mip_level: 0,
                        origin: ::wgpu::Origin3d {
                            x: region.x,
                            y: region.y,
                            z: 0,
                        },
                        aspect: ::wgpu::TextureAspect::All,
                    },
                    ::wgpu::Extent3d {
                        width: region.width,
                        height: region.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
            // wgpu tracks texture usage itself
            Command::ChangeLayout { .. } => {}
            Command::GenerateMipmap { surface, .. } => {
                tessera_warn_rate_limited!(
                    LogCategory::Backend,
                    "Mipmap generation is not available on wgpu surfaces ({:?})",
                    surface
                );
            }
            Command::BeginRenderPass { clear_color, .. } => {
                let view = match target {
                    Target::Surface {
                        acquired: Some(frame),
                        ..
                    } => frame
                        .texture
                        .create_view(&::wgpu::TextureViewDescriptor::default()),
                    Target::Offscreen { texture } => {
                        texture.create_view(&::wgpu::TextureViewDescriptor::default())
                    }
                    Target::Surface { acquired: None, .. } => {
                        warn!("render pass without an acquired image");
                        return;
                    }
                };
                let load = match clear_color {
                    Some([r, g, b, a]) => ::wgpu::LoadOp::Clear(::wgpu::Color {
                        r: r as f64,
                        g: g as f64,
                        b: b as f64,
                        a: a as f64,
                    }),
                    None => ::wgpu::LoadOp::Load,
                };
                // Draw encoding belongs to the command adapters; the pass applies its load op
                let _pass = encoder.begin_render_pass(&::wgpu::RenderPassDescriptor {
                    label: Some("tessera frame"),
                    color_attachments: &[Some(::wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        ops: ::wgpu::Operations {
                            load,
                            store: ::wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
            Command::EndRenderPass => {}
        }
    }
}

impl MemoryProvider for WgpuBackend {
    fn alloc_memory(&self, size: u64, kind: MemoryKind) -> Option<MemoryHandle> {
        let size = align_copy(size);
        if size > self.device.limits().max_buffer_size {
            return None;
        }
        let buffer = self.device.create_buffer(&::wgpu::BufferDescriptor {
            label: Some(kind.as_str()),
            size,
            usage: buffer_usages(kind),
            mapped_at_creation: false,
        });
        Some(self.state.lock().buffers.insert(buffer))
    }

    fn free_memory(&self, memory: MemoryHandle, _size: u64, _kind: MemoryKind) {
        if let Some(buffer) = self.state.lock().buffers.remove(memory) {
            buffer.destroy();
        }
    }

    fn alloc_surface(&self, width: u32, height: u32) -> Option<SurfaceHandle> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return None;
        }
        let texture = self.device.create_texture(&::wgpu::TextureDescriptor {
            label: Some("tessera atlas page"),
            size: ::wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: ::wgpu::TextureDimension::D2,
            format: ::wgpu::TextureFormat::Rgba8Unorm,
            usage: ::wgpu::TextureUsages::TEXTURE_BINDING
                | ::wgpu::TextureUsages::COPY_DST
                | ::wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        Some(self.state.lock().textures.insert(texture))
    }

    fn free_surface(&self, surface: SurfaceHandle, _width: u32, _height: u32) {
        if let Some(texture) = self.state.lock().textures.remove(surface) {
            texture.destroy();
        }
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let buffer = state.buffers.get(memory).ok_or_else(|| {
            TesseraError::invalid_argument(format!("unknown buffer {:?}", memory))
        })?;
        if offset % ::wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(TesseraError::invalid_range(format!(
                "write offset {} is not {} byte aligned",
                offset,
                ::wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }
        let padded_len = align_copy(data.len() as u64);
        if offset.saturating_add(padded_len) > buffer.size() {
            return Err(TesseraError::invalid_range(format!(
                "write of {} bytes at {} exceeds buffer of {} bytes",
                data.len(),
                offset,
                buffer.size()
            )));
        }
        if padded_len == data.len() as u64 {
            self.queue.write_buffer(buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len as usize, 0);
            self.queue.write_buffer(buffer, offset, &padded);
        }
        Ok(())
    }
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        Ok(self
            .state
            .lock()
            .fences
            .insert(Arc::new(AtomicBool::new(signaled))))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(fence);
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<bool> {
        let flag = self.state.lock().fences.get(fence).cloned().ok_or_else(|| {
            TesseraError::invalid_argument(format!("unknown fence {:?}", fence))
        })?;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if flag.load(Ordering::Acquire) {
                return Ok(true);
            }
            self.check_device()?;
            match deadline {
                None => {
                    self.device.poll(::wgpu::Maintain::Wait);
                }
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.device.poll(::wgpu::Maintain::Poll);
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    fn fence_signaled(&self, fence: FenceHandle) -> bool {
        self.device.poll(::wgpu::Maintain::Poll);
        self.state
            .lock()
            .fences
            .get(fence)
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    fn reset_fence(&self, fence: FenceHandle) {
        if let Some(flag) = self.state.lock().fences.get(fence) {
            flag.store(false, Ordering::Release);
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        Ok(self.state.lock().semaphores.insert(()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(semaphore);
    }

    fn submit(&self, submission: &SubmitInfo<'_>) -> Result<()> {
        self.check_device()?;

        let target = self.target.lock();
        let state = self.state.lock();
        let fence = match submission.fence {
            Some(fence) => Some(state.fences.get(fence).cloned().ok_or_else(|| {
                TesseraError::invalid_argument(format!("unknown fence {:?}", fence))
            })?),
            None => None,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("tessera submission"),
            });
        for command in submission.commands {
            self.encode(&state, &target, &mut encoder, command);
        }
        drop(state);
        drop(target);

        self.queue.submit(Some(encoder.finish()));
        if let Some(flag) = fence {
            self.queue.on_submitted_work_done(move || {
                flag.store(true, Ordering::Release);
            });
        }
        Ok(())
    }

    fn acquire_next_image(&self, _signal: SemaphoreHandle) -> Result<u32> {
        self.check_device()?;
        let mut target = self.target.lock();
        let Target::Surface {
            surface, acquired, ..
        } = &mut *target
        else {
            return Ok(0);
        };

        match surface.get_current_texture() {
            Ok(frame) => {
                if frame.suboptimal {
                    debug!("suboptimal surface texture acquired");
                }
                *acquired = Some(frame);
                Ok(0)
            }
            Err(::wgpu::SurfaceError::Outdated) => {
                Err(TesseraError::surface_outdated("wgpu surface outdated"))
            }
            Err(::wgpu::SurfaceError::Lost) => Err(TesseraError::device_lost("wgpu surface lost")),
            Err(::wgpu::SurfaceError::Timeout) => {
                Err(TesseraError::timeout("wgpu surface acquire timed out"))
            }
            Err(::wgpu::SurfaceError::OutOfMemory) => {
                Err(TesseraError::out_of_memory("wgpu surface out of memory"))
            }
        }
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreHandle) -> Result<()> {
        self.check_device()?;
        if let Target::Surface { acquired, .. } = &mut *self.target.lock() {
            match acquired.take() {
                Some(frame) => frame.present(),
                None => {
                    return Err(TesseraError::invalid_argument(
                        "present without an acquired image",
                    ))
                }
            }
        }
        Ok(())
    }

    fn release_image(&self, _image_index: u32, _acquired: SemaphoreHandle) {
        // dropping an unpresented surface texture discards it
        if let Target::Surface { acquired, .. } = &mut *self.target.lock() {
            acquired.take();
        }
    }

    fn recreate_swapchain(&self) -> Result<u32> {
        self.check_device()?;
        if let Target::Surface {
            surface,
            config,
            acquired,
        } = &mut *self.target.lock()
        {
            *acquired = None;
            surface.configure(&self.device, config);
            debug!("surface reconfigured to {}x{}", config.width, config.height);
        }
        Ok(1)
    }

    fn image_count(&self) -> u32 {
        1
    }

    fn create_framebuffer(&self, image_index: u32) -> Result<FramebufferHandle> {
        if image_index != 0 {
            return Err(TesseraError::invalid_argument(format!(
                "no swapchain image {}",
                image_index
            )));
        }
        Ok(self.state.lock().framebuffers.insert(image_index))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.state.lock().framebuffers.remove(framebuffer);
    }

    fn copy_row_alignment(&self) -> u32 {
        ::wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
    }

    fn copy_buffer_alignment(&self) -> u64 {
        ::wgpu::COPY_BUFFER_ALIGNMENT
    }
}
