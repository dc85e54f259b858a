//! Frame pacing between CPU recording and GPU execution
//!
//! Each frame in flight owns a slot with two semaphores and a fence. A frame
//! blocks on its slot's fence before touching the slot again, so the CPU never
//! runs more than `max_frames_in_flight` frames ahead of the GPU. Device loss
//! and outdated surfaces are recovered here by rebuilding the swapchain, while
//! allocator state is left untouched.

use crate::backend::{
    Command, Fence, FramebufferHandle, Semaphore, SharedBackend, SubmitInfo,
};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use tessera_core::logging::LogCategory;
use tessera_core::{
    tessera_info, tessera_warn, ErrorContext, FrameConfig, Result, TesseraError,
};
use tracing::{debug, instrument, warn};

/// Outcome of one [`FrameSynchronizer::render_frame`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// The device or surface was lost; the swapchain has been rebuilt and the
    /// frame was dropped
    Recovered,
}

/// Frame synchronizer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub recoveries: u64,
    /// Slot fence waits that had to block on the GPU
    pub blocked_waits: u64,
}

/// Per-frame-in-flight synchronization objects
pub struct FrameSlot {
    image_available: Semaphore,
    render_finished: Semaphore,
    gpu_lock: Fence,
    transient: Vec<Box<dyn Any + Send>>,
}

impl FrameSlot {
    fn new(backend: &SharedBackend) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(backend.clone())?,
            render_finished: Semaphore::new(backend.clone())?,
            // signaled so the first use of the slot does not wait
            gpu_lock: Fence::new(backend.clone(), true)?,
            transient: Vec::new(),
        })
    }

    pub fn gpu_lock(&self) -> &Fence {
        &self.gpu_lock
    }

    pub fn transient_count(&self) -> usize {
        self.transient.len()
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("gpu_lock", &self.gpu_lock)
            .field("transient", &self.transient.len())
            .finish()
    }
}

/// Command recording surface handed to the per-frame closure
pub struct FrameRecorder<'a> {
    commands: Vec<Command>,
    transient: &'a mut Vec<Box<dyn Any + Send>>,
    framebuffer: FramebufferHandle,
    image_index: u32,
    frame_number: u64,
}

impl FrameRecorder<'_> {
    pub fn record(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn begin_render_pass(&mut self, clear_color: Option<[f32; 4]>) {
        self.commands.push(Command::BeginRenderPass {
            framebuffer: self.framebuffer,
            clear_color,
        });
    }

    pub fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    /// Keep `resource` alive until the GPU finished this frame
    pub fn hold<T: Any + Send>(&mut self, resource: T) {
        self.transient.push(Box::new(resource));
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Frames rendered since creation or the last recovery
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

pub struct FrameSynchronizer {
    backend: SharedBackend,
    slots: Vec<FrameSlot>,
    framebuffers: Vec<FramebufferHandle>,
    frame_counter: u64,
    device_loss_timeout: Duration,
    stats: FrameStats,
}

impl FrameSynchronizer {
    pub fn new(backend: SharedBackend, config: &FrameConfig) -> Result<Self> {
        if config.max_frames_in_flight == 0 {
            return Err(TesseraError::configuration_with_context(
                "max_frames_in_flight must be at least 1",
                ErrorContext::new("new", "FrameSynchronizer"),
            ));
        }

        let slots = (0..config.max_frames_in_flight)
            .map(|_| FrameSlot::new(&backend))
            .collect::<Result<Vec<_>>>()?;
        let framebuffers = create_framebuffers(&backend, backend.image_count())?;

        debug!(
            "frame synchronizer: {} slots, {} swapchain images on {}",
            slots.len(),
            framebuffers.len(),
            backend.name()
        );

        Ok(Self {
            backend,
            slots,
            framebuffers,
            frame_counter: 0,
            device_loss_timeout: Duration::from_millis(config.device_loss_timeout_ms),
            stats: FrameStats::default(),
        })
    }

    /// Render and present one frame.
    ///
    /// `record` fills the frame's command list. Device loss and outdated
    /// surfaces are recovered locally and reported as [`FrameStatus::Recovered`];
    /// every other error is returned.
    #[instrument(skip(self, record), fields(frame = self.frame_counter), level = "trace")]
    pub fn render_frame<F>(&mut self, record: F) -> Result<FrameStatus>
    where
        F: FnOnce(&mut FrameRecorder<'_>) -> Result<()>,
    {
        match self.try_render(record) {
            Ok(image_index) => Ok(FrameStatus::Presented { image_index }),
            Err(err) if err.is_device_lost() => {
                tessera_warn!(
                    LogCategory::Frame,
                    "Frame {} lost: {}",
                    self.frame_counter,
                    err.format_for_log()
                );
                self.recover()?;
                Ok(FrameStatus::Recovered)
            }
            Err(err) => Err(err),
        }
    }

    fn try_render<F>(&mut self, record: F) -> Result<u32>
    where
        F: FnOnce(&mut FrameRecorder<'_>) -> Result<()>,
    {
        let slot_index = self.current_slot();
        let slot = &mut self.slots[slot_index];

        if !slot.gpu_lock.is_signaled() {
            self.stats.blocked_waits += 1;
        }
        slot.gpu_lock.wait()?;
        slot.transient.clear();

        let image_index = self
            .backend
            .acquire_next_image(slot.image_available.handle())?;
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .ok_or_else(|| {
                TesseraError::backend(format!(
                    "acquired image {} without a framebuffer",
                    image_index
                ))
            })?;

        let mut recorder = FrameRecorder {
            commands: Vec::new(),
            transient: &mut slot.transient,
            framebuffer,
            image_index,
            frame_number: self.frame_counter,
        };
        if let Err(err) = record(&mut recorder) {
            self.backend
                .release_image(image_index, slot.image_available.handle());
            return Err(err);
        }
        let FrameRecorder { commands, .. } = recorder;

        slot.gpu_lock.reset();
        let submitted = self.backend.submit(
            &SubmitInfo::new(&commands)
                .wait_on(slot.image_available.handle())
                .signal(slot.render_finished.handle())
                .fence(slot.gpu_lock.handle()),
        );
        if let Err(err) = submitted {
            self.backend
                .release_image(image_index, slot.image_available.handle());
            // nothing was queued, so nothing will ever signal the reset fence
            match Fence::new(self.backend.clone(), true) {
                Ok(fence) => slot.gpu_lock = fence,
                Err(fence_err) => warn!("slot {} fence not re-armed: {}", slot_index, fence_err),
            }
            return Err(err);
        }
        self.backend
            .present(image_index, slot.render_finished.handle())?;

        self.frame_counter += 1;
        self.stats.frames_presented += 1;
        Ok(image_index)
    }

    fn recover(&mut self) -> Result<()> {
        for (index, slot) in self.slots.iter().enumerate() {
            match slot.gpu_lock.wait_timeout(self.device_loss_timeout) {
                Ok(true) => {}
                Ok(false) => warn!("slot {} fence still pending after device loss", index),
                Err(err) => warn!("slot {} fence wait failed: {}", index, err),
            }
        }

        self.rebuild_swapchain()?;
        self.slots = (0..self.slots.len())
            .map(|_| FrameSlot::new(&self.backend))
            .collect::<Result<Vec<_>>>()?;
        self.frame_counter = 0;
        self.stats.recoveries += 1;

        tessera_info!(
            LogCategory::Frame,
            "Recovered swapchain with {} images",
            self.framebuffers.len()
        );
        Ok(())
    }

    /// Recreate the swapchain and its framebuffers, e.g. after a resize.
    /// Waits for every frame in flight first.
    pub fn resize(&mut self) -> Result<()> {
        self.wait_idle()?;
        self.rebuild_swapchain()
    }

    fn rebuild_swapchain(&mut self) -> Result<()> {
        for framebuffer in self.framebuffers.drain(..) {
            self.backend.destroy_framebuffer(framebuffer);
        }
        let image_count = self.backend.recreate_swapchain()?;
        self.framebuffers = create_framebuffers(&self.backend, image_count)?;
        Ok(())
    }

    /// Block until every submitted frame finished, then drop transient resources
    pub fn wait_idle(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.gpu_lock.wait()?;
            slot.transient.clear();
        }
        Ok(())
    }

    /// Slot the next frame will use
    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.slots.len() as u64) as usize
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn framebuffers(&self) -> &[FramebufferHandle] {
        &self.framebuffers
    }

    pub fn stats(&self) -> FrameStats {
        self.stats.clone()
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Err(err) = slot.gpu_lock.wait_timeout(self.device_loss_timeout) {
                warn!("frame slot fence wait failed on shutdown: {}", err);
            }
        }
        for framebuffer in self.framebuffers.drain(..) {
            self.backend.destroy_framebuffer(framebuffer);
        }
    }
}

impl fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("slots", &self.slots.len())
            .field("frame_counter", &self.frame_counter)
            .field("stats", &self.stats)
            .finish()
    }
}

fn create_framebuffers(backend: &SharedBackend, image_count: u32) -> Result<Vec<FramebufferHandle>> {
    (0..image_count)
        .map(|index| backend.create_framebuffer(index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, HeadlessBackend};
    use std::sync::Arc;

    fn synchronizer(backend: &Arc<HeadlessBackend>, frames: usize) -> FrameSynchronizer {
        let config = FrameConfig {
            max_frames_in_flight: frames,
            device_loss_timeout_ms: 50,
        };
        FrameSynchronizer::new(backend.clone(), &config).unwrap()
    }

    #[test]
    fn test_presents_in_image_order() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut frames = synchronizer(&backend, 2);

        for expected in [0, 1, 2, 0] {
            let status = frames
                .render_frame(|recorder| {
                    recorder.begin_render_pass(Some([0.0, 0.0, 0.0, 1.0]));
                    recorder.end_render_pass();
                    Ok(())
                })
                .unwrap();
            assert_eq!(status, FrameStatus::Presented { image_index: expected });
        }
        assert_eq!(frames.stats().frames_presented, 4);
        assert_eq!(frames.current_slot(), 0);
    }

    #[test]
    fn test_zero_frames_in_flight_is_rejected() {
        let backend = Arc::new(HeadlessBackend::default());
        let config = FrameConfig {
            max_frames_in_flight: 0,
            ..Default::default()
        };
        assert!(FrameSynchronizer::new(backend, &config).is_err());
    }

    #[test]
    fn test_transient_resources_live_until_slot_reuse() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut frames = synchronizer(&backend, 2);
        let marker = Arc::new(());

        let held = marker.clone();
        frames
            .render_frame(move |recorder| {
                recorder.hold(held);
                Ok(())
            })
            .unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);

        frames.render_frame(|_| Ok(())).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);
        // slot 0 again
        frames.render_frame(|_| Ok(())).unwrap();
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_record_error_propagates() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut frames = synchronizer(&backend, 2);
        let err = frames
            .render_frame(|_| Err(TesseraError::invalid_argument("bad draw")))
            .unwrap_err();
        assert!(err.is_programmer_error());
        assert_eq!(backend.submission_count(), 0);
        assert_eq!(frames.frame_counter(), 0);
    }

    #[test]
    fn test_outdated_surface_recovers() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut frames = synchronizer(&backend, 2);
        frames.render_frame(|_| Ok(())).unwrap();

        backend.inject_surface_outdated();
        assert_eq!(frames.render_frame(|_| Ok(())).unwrap(), FrameStatus::Recovered);
        assert_eq!(frames.frame_counter(), 0);
        assert_eq!(backend.live_framebuffers(), 3);
        assert!(backend
            .events()
            .contains(&BackendEvent::SwapchainRecreated { image_count: 3 }));

        assert_eq!(
            frames.render_frame(|_| Ok(())).unwrap(),
            FrameStatus::Presented { image_index: 0 }
        );
    }

    #[test]
    fn test_resize_rebuilds_framebuffers() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut frames = synchronizer(&backend, 2);
        let before = frames.framebuffers().to_vec();
        frames.resize().unwrap();
        assert_eq!(frames.framebuffers().len(), before.len());
        assert!(frames.framebuffers().iter().all(|fb| !before.contains(fb)));
        assert_eq!(backend.live_framebuffers(), 3);
    }
}
