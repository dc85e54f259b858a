//! CPU reference backend
//!
//! Memory blocks and surfaces are host byte vectors and submitted command lists
//! execute on the CPU. Completion is either immediate (`auto_complete`) or driven
//! by the caller through [`HeadlessBackend::complete_next`], which makes fence
//! behaviour observable without a GPU. Device loss and outdated surfaces can be
//! injected, and every queue-level operation is appended to an event log.

use super::{
    Backend, Command, FenceHandle, FramebufferHandle, ImageLayout, MemoryHandle, MemoryKind,
    MemoryProvider, SemaphoreHandle, SubmitInfo, SurfaceHandle, SURFACE_BYTES_PER_TEXEL,
};
use parking_lot::{Condvar, Mutex};
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tessera_core::{Region, Result, TesseraError};
use tracing::{debug, warn};

/// Headless backend configuration
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Complete every submission as soon as it is submitted
    pub auto_complete: bool,
    /// Total bytes of device memory the backend hands out before returning null
    pub memory_budget: Option<u64>,
    /// Number of live surfaces the backend hands out before returning null
    pub max_surfaces: Option<usize>,
    /// Swapchain image count
    pub image_count: u32,
    /// Required `bytes_per_row` alignment for buffer-to-surface copies
    pub copy_row_alignment: u32,
    /// Required offset and size alignment for buffer-to-buffer copies
    pub copy_buffer_alignment: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            auto_complete: true,
            memory_budget: None,
            max_surfaces: None,
            image_count: 3,
            copy_row_alignment: 1,
            copy_buffer_alignment: 1,
        }
    }
}

/// Queue-level operations in the order the backend observed them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// A fence wait returned with the fence signaled. `blocked` is set when the
    /// caller had to wait for completion.
    FenceWaited { fence: FenceHandle, blocked: bool },
    Submitted {
        fence: Option<FenceHandle>,
        commands: usize,
    },
    Completed { fence: Option<FenceHandle> },
    Acquired { image_index: u32 },
    Presented { image_index: u32 },
    /// An acquired image was given back without being presented
    Released { image_index: u32 },
    SwapchainRecreated { image_count: u32 },
    DeviceLost,
}

struct HeadlessSurface {
    width: u32,
    height: u32,
    texels: Vec<u8>,
    layout: ImageLayout,
    mip_count: u32,
}

struct PendingBatch {
    commands: Vec<Command>,
    signal: Option<SemaphoreHandle>,
    fence: Option<FenceHandle>,
}

struct HeadlessState {
    memory: SlotMap<MemoryHandle, Vec<u8>>,
    memory_in_use: u64,
    surfaces: SlotMap<SurfaceHandle, HeadlessSurface>,
    fences: SlotMap<FenceHandle, bool>,
    semaphores: SlotMap<SemaphoreHandle, bool>,
    framebuffers: SlotMap<FramebufferHandle, u32>,
    pending: VecDeque<PendingBatch>,
    submissions: u64,
    image_count: u32,
    next_image: u32,
    lost: bool,
    surface_outdated: bool,
    fail_next_submit: bool,
    events: Vec<BackendEvent>,
}

impl HeadlessState {
    fn complete(&mut self, batch: PendingBatch) {
        for command in &batch.commands {
            self.execute(command);
        }
        if let Some(semaphore) = batch.signal.and_then(|s| self.semaphores.get_mut(s)) {
            *semaphore = true;
        }
        if let Some(fence) = batch.fence.and_then(|f| self.fences.get_mut(f)) {
            *fence = true;
        }
        self.events.push(BackendEvent::Completed { fence: batch.fence });
    }

    fn execute(&mut self, command: &Command) {
        match *command {
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let Some(bytes) = self
                    .memory
                    .get(src)
                    .and_then(|m| slice_at(m, src_offset, size))
                    .map(<[u8]>::to_vec)
                else {
                    warn!("copy source {:?} out of range", src);
                    return;
                };
                match self
                    .memory
                    .get_mut(dst)
                    .and_then(|m| slice_at_mut(m, dst_offset, size))
                {
                    Some(target) => target.copy_from_slice(&bytes),
                    None => warn!("copy destination {:?} out of range", dst),
                }
            }
            Command::CopyBufferToSurface {
                src,
                src_offset,
                bytes_per_row,
                dst,
                region,
            } => {
                let Some(source) = self.memory.get(src) else {
                    warn!("copy source {:?} is not live", src);
                    return;
                };
                let Some(surface) = self.surfaces.get_mut(dst) else {
                    warn!("copy destination {:?} is not live", dst);
                    return;
                };
                if !Region::with_size(surface.width, surface.height).contains(&region) {
                    warn!("copy region {:?} exceeds surface {:?}", region, dst);
                    return;
                }
                let row_bytes = (region.width * SURFACE_BYTES_PER_TEXEL) as u64;
                for row in 0..region.height {
                    let src_start = src_offset + row as u64 * bytes_per_row as u64;
                    let Some(texels) = slice_at(source, src_start, row_bytes) else {
                        warn!("copy source {:?} shorter than region {:?}", src, region);
                        return;
                    };
                    let dst_start = (((region.y + row) * surface.width + region.x)
                        * SURFACE_BYTES_PER_TEXEL) as usize;
                    surface.texels[dst_start..dst_start + row_bytes as usize]
                        .copy_from_slice(texels);
                }
            }
            Command::ChangeLayout {
                surface,
                old_layout,
                new_layout,
                ..
            } => {
                if let Some(surface) = self.surfaces.get_mut(surface) {
                    if old_layout != ImageLayout::Undefined && old_layout != surface.layout {
                        warn!(
                            "layout transition from {:?} but surface is in {:?}",
                            old_layout, surface.layout
                        );
                    }
                    surface.layout = new_layout;
                }
            }
            Command::GenerateMipmap {
                surface, mip_count, ..
            } => {
                if let Some(surface) = self.surfaces.get_mut(surface) {
                    surface.mip_count = mip_count;
                }
            }
            Command::BeginRenderPass { .. } | Command::EndRenderPass => {}
        }
    }

    fn consume_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()> {
        match self.semaphores.get_mut(semaphore) {
            Some(state) => {
                *state = false;
                Ok(())
            }
            None => Err(TesseraError::invalid_argument(format!(
                "unknown semaphore {:?}",
                semaphore
            ))),
        }
    }
}

fn slice_at(bytes: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    bytes.get(start..end)
}

fn slice_at_mut(bytes: &mut [u8], offset: u64, size: u64) -> Option<&mut [u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    bytes.get_mut(start..end)
}

/// CPU reference implementation of [`Backend`]
pub struct HeadlessBackend {
    config: HeadlessConfig,
    state: Mutex<HeadlessState>,
    completed: Condvar,
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        let image_count = config.image_count.max(1);
        Self {
            config,
            state: Mutex::new(HeadlessState {
                memory: SlotMap::with_key(),
                memory_in_use: 0,
                surfaces: SlotMap::with_key(),
                fences: SlotMap::with_key(),
                semaphores: SlotMap::with_key(),
                framebuffers: SlotMap::with_key(),
                pending: VecDeque::new(),
                submissions: 0,
                image_count,
                next_image: 0,
                lost: false,
                surface_outdated: false,
                fail_next_submit: false,
                events: Vec::new(),
            }),
            completed: Condvar::new(),
        }
    }

    /// Backend whose submissions stay pending until completed explicitly
    pub fn manual() -> Self {
        Self::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        })
    }

    /// Execute the oldest pending submission and signal its fence
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(batch) = state.pending.pop_front() else {
            return false;
        };
        state.complete(batch);
        self.completed.notify_all();
        true
    }

    /// Execute every pending submission. Returns how many completed.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while let Some(batch) = state.pending.pop_front() {
            state.complete(batch);
            count += 1;
        }
        self.completed.notify_all();
        count
    }

    /// Lose the device: pending work is dropped, every fence is signaled, and
    /// queue operations fail with `DeviceLost` until the swapchain is recreated.
    pub fn inject_device_loss(&self) {
        let mut state = self.state.lock();
        state.lost = true;
        state.pending.clear();
        for (_, signaled) in state.fences.iter_mut() {
            *signaled = true;
        }
        state.events.push(BackendEvent::DeviceLost);
        self.completed.notify_all();
        warn!("headless backend: device lost");
    }

    /// Make the next image acquisition report an outdated surface
    pub fn inject_surface_outdated(&self) {
        self.state.lock().surface_outdated = true;
    }

    /// Make the next submission fail with a backend error. The device stays
    /// usable and nothing is queued.
    pub fn inject_submit_failure(&self) {
        self.state.lock().fail_next_submit = true;
    }

    pub fn pending_batches(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn read_memory(&self, memory: MemoryHandle) -> Option<Vec<u8>> {
        self.state.lock().memory.get(memory).cloned()
    }

    /// Texels of `region`, row by row, tightly packed
    pub fn read_surface(&self, surface: SurfaceHandle, region: Region) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let surface = state.surfaces.get(surface)?;
        if !Region::with_size(surface.width, surface.height).contains(&region) {
            return None;
        }
        let row_bytes = (region.width * SURFACE_BYTES_PER_TEXEL) as usize;
        let mut texels = Vec::with_capacity(row_bytes * region.height as usize);
        for row in 0..region.height {
            let start =
                (((region.y + row) * surface.width + region.x) * SURFACE_BYTES_PER_TEXEL) as usize;
            texels.extend_from_slice(&surface.texels[start..start + row_bytes]);
        }
        Some(texels)
    }

    pub fn surface_layout(&self, surface: SurfaceHandle) -> Option<ImageLayout> {
        self.state.lock().surfaces.get(surface).map(|s| s.layout)
    }

    pub fn surface_mip_count(&self, surface: SurfaceHandle) -> Option<u32> {
        self.state.lock().surfaces.get(surface).map(|s| s.mip_count)
    }

    pub fn live_memory_blocks(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn memory_in_use(&self) -> u64 {
        self.state.lock().memory_in_use
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl MemoryProvider for HeadlessBackend {
    fn alloc_memory(&self, size: u64, kind: MemoryKind) -> Option<MemoryHandle> {
        let mut state = self.state.lock();
        if let Some(budget) = self.config.memory_budget {
            if state.memory_in_use.saturating_add(size) > budget {
                debug!(
                    "headless budget exhausted: {} + {} > {} ({})",
                    state.memory_in_use,
                    size,
                    budget,
                    kind.as_str()
                );
                return None;
            }
        }
        let len = usize::try_from(size).ok()?;
        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(len).is_err() {
            debug!("headless host allocation of {} bytes refused", size);
            return None;
        }
        bytes.resize(len, 0);
        state.memory_in_use += size;
        Some(state.memory.insert(bytes))
    }

    fn free_memory(&self, memory: MemoryHandle, size: u64, _kind: MemoryKind) {
        let mut state = self.state.lock();
        if state.memory.remove(memory).is_some() {
            state.memory_in_use = state.memory_in_use.saturating_sub(size);
        } else {
            warn!("free of unknown memory block {:?}", memory);
        }
    }

    fn alloc_surface(&self, width: u32, height: u32) -> Option<SurfaceHandle> {
        let mut state = self.state.lock();
        if let Some(max) = self.config.max_surfaces {
            if state.surfaces.len() >= max {
                return None;
            }
        }
        let len = width as usize * height as usize * SURFACE_BYTES_PER_TEXEL as usize;
        Some(state.surfaces.insert(HeadlessSurface {
            width,
            height,
            texels: vec![0u8; len],
            layout: ImageLayout::Undefined,
            mip_count: 1,
        }))
    }

    fn free_surface(&self, surface: SurfaceHandle, _width: u32, _height: u32) {
        if self.state.lock().surfaces.remove(surface).is_none() {
            warn!("free of unknown surface {:?}", surface);
        }
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let block = state.memory.get_mut(memory).ok_or_else(|| {
            TesseraError::invalid_argument(format!("unknown memory block {:?}", memory))
        })?;
        let len = block.len();
        let target = slice_at_mut(block, offset, data.len() as u64).ok_or_else(|| {
            TesseraError::invalid_range(format!(
                "write of {} bytes at {} exceeds block of {} bytes",
                data.len(),
                offset,
                len
            ))
        })?;
        target.copy_from_slice(data);
        Ok(())
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        Ok(self.state.lock().fences.insert(signaled))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(fence);
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let mut blocked = false;
        loop {
            match state.fences.get(fence) {
                None => {
                    return Err(TesseraError::invalid_argument(format!(
                        "unknown fence {:?}",
                        fence
                    )))
                }
                Some(true) => break,
                Some(false) => {}
            }
            blocked = true;
            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out()
                        && !state.fences.get(fence).copied().unwrap_or(false)
                    {
                        return Ok(false);
                    }
                }
                None => self.completed.wait(&mut state),
            }
        }
        state.events.push(BackendEvent::FenceWaited { fence, blocked });
        Ok(true)
    }

    fn fence_signaled(&self, fence: FenceHandle) -> bool {
        self.state.lock().fences.get(fence).copied().unwrap_or(false)
    }

    fn reset_fence(&self, fence: FenceHandle) {
        if let Some(signaled) = self.state.lock().fences.get_mut(fence) {
            *signaled = false;
        }
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        Ok(self.state.lock().semaphores.insert(false))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(semaphore);
    }

    fn submit(&self, submission: &SubmitInfo<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(TesseraError::device_lost("submit on lost headless device"));
        }
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(TesseraError::backend("headless queue rejected the submission"));
        }
        if let Some(fence) = submission.fence {
            if !state.fences.contains_key(fence) {
                return Err(TesseraError::invalid_argument(format!(
                    "unknown fence {:?}",
                    fence
                )));
            }
        }
        if let Some(wait) = submission.wait {
            state.consume_semaphore(wait)?;
        }

        state.submissions += 1;
        state.events.push(BackendEvent::Submitted {
            fence: submission.fence,
            commands: submission.commands.len(),
        });

        let batch = PendingBatch {
            commands: submission.commands.to_vec(),
            signal: submission.signal,
            fence: submission.fence,
        };
        if self.config.auto_complete {
            state.complete(batch);
            self.completed.notify_all();
        } else {
            state.pending.push_back(batch);
        }
        Ok(())
    }

    fn acquire_next_image(&self, signal: SemaphoreHandle) -> Result<u32> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(TesseraError::device_lost("acquire on lost headless device"));
        }
        if std::mem::take(&mut state.surface_outdated) {
            return Err(TesseraError::surface_outdated("headless swapchain outdated"));
        }
        match state.semaphores.get_mut(signal) {
            Some(signaled) => *signaled = true,
            None => {
                return Err(TesseraError::invalid_argument(format!(
                    "unknown semaphore {:?}",
                    signal
                )))
            }
        }
        let image_index = state.next_image;
        state.next_image = (state.next_image + 1) % state.image_count;
        state.events.push(BackendEvent::Acquired { image_index });
        Ok(image_index)
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(TesseraError::device_lost("present on lost headless device"));
        }
        if image_index >= state.image_count {
            return Err(TesseraError::invalid_argument(format!(
                "image index {} out of {}",
                image_index, state.image_count
            )));
        }
        state.consume_semaphore(wait)?;
        state.events.push(BackendEvent::Presented { image_index });
        Ok(())
    }

    fn release_image(&self, image_index: u32, acquired: SemaphoreHandle) {
        let mut state = self.state.lock();
        if let Err(err) = state.consume_semaphore(acquired) {
            warn!("release of image {}: {}", image_index, err);
        }
        state.events.push(BackendEvent::Released { image_index });
    }

    fn recreate_swapchain(&self) -> Result<u32> {
        let mut state = self.state.lock();
        state.lost = false;
        state.surface_outdated = false;
        state.next_image = 0;
        state.image_count = self.config.image_count.max(1);
        let image_count = state.image_count;
        state
            .events
            .push(BackendEvent::SwapchainRecreated { image_count });
        Ok(image_count)
    }

    fn image_count(&self) -> u32 {
        self.state.lock().image_count
    }

    fn create_framebuffer(&self, image_index: u32) -> Result<FramebufferHandle> {
        let mut state = self.state.lock();
        if image_index >= state.image_count {
            return Err(TesseraError::invalid_argument(format!(
                "no swapchain image {}",
                image_index
            )));
        }
        Ok(state.framebuffers.insert(image_index))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.state.lock().framebuffers.remove(framebuffer);
    }

    fn copy_row_alignment(&self) -> u32 {
        self.config.copy_row_alignment.max(1)
    }

    fn copy_buffer_alignment(&self) -> u64 {
        self.config.copy_buffer_alignment.max(1)
    }
}
