//! Double-buffered upload pipeline
//!
//! Two [`DataStream`]s are handed out round-robin. A stream records transfer
//! commands while the other may still be executing; acquiring a stream whose
//! previous batch has not retired blocks on that batch's fence, so at most two
//! upload batches are ever in flight.

use crate::atlas::AtlasAllocation;
use crate::backend::{
    Command, CopyTarget, Fence, ImageLayout, MemoryKind, SharedBackend, SubmitInfo,
    SurfaceHandle, SURFACE_BYTES_PER_TEXEL,
};
use crate::memory::{align_offset, LinearAllocation, LinearAllocator};
use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tessera_core::logging::LogCategory;
use tessera_core::{
    tessera_debug, tessera_error_rate_limited, ErrorContext, Result, TesseraError,
};
use tracing::{instrument, trace};

/// Number of recording contexts in the ring
pub const STREAM_COUNT: usize = 2;

/// Alignment of staging sub-allocations
pub const STAGING_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Recording,
    /// Submitted, fence not yet observed signaled
    Waiting,
}

/// Upload engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub submissions: u64,
    /// Commits that recorded nothing and submitted nothing
    pub empty_commits: u64,
    pub failed_submissions: u64,
    /// Acquisitions that had to wait for a batch still executing
    pub blocked_waits: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub bytes_staged: u64,
}

/// One recording context of the upload ring
pub struct DataStream {
    index: usize,
    state: StreamState,
    commands: Vec<Command>,
    retained: Vec<Box<dyn Any + Send>>,
    fence: Fence,
}

impl DataStream {
    fn new(index: usize, backend: SharedBackend) -> Result<Self> {
        Ok(Self {
            index,
            state: StreamState::Idle,
            commands: Vec::new(),
            retained: Vec::new(),
            fence: Fence::new(backend, true)?,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn reset(&mut self) {
        self.commands.clear();
        self.retained.clear();
        self.state = StreamState::Idle;
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .field("retained", &self.retained.len())
            .finish()
    }
}

/// Round-robin ring of [`DataStream`]s
pub struct UploadEngine {
    backend: SharedBackend,
    staging: LinearAllocator,
    streams: Vec<Mutex<DataStream>>,
    next: AtomicUsize,
    stats: Mutex<UploadStats>,
}

impl UploadEngine {
    /// `staging` serves the host-visible source ranges of the `write_*` helpers
    pub fn new(backend: SharedBackend, staging: LinearAllocator) -> Result<Self> {
        let streams = (0..STREAM_COUNT)
            .map(|index| DataStream::new(index, backend.clone()).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            backend,
            staging,
            streams,
            next: AtomicUsize::new(0),
            stats: Mutex::new(UploadStats::default()),
        })
    }

    /// Acquire the next stream, blocking until its previous batch retired
    #[instrument(skip(self), level = "trace")]
    pub fn get(&self) -> Result<Data<'_>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % STREAM_COUNT;
        let mut stream = self.streams[index].lock();
        self.retire(&mut stream)?;
        stream.state = StreamState::Recording;
        trace!("upload stream {} recording", index);

        Ok(Data {
            engine: self,
            stream,
            committed: false,
        })
    }

    fn retire(&self, stream: &mut DataStream) -> Result<()> {
        if stream.state != StreamState::Waiting {
            return Ok(());
        }
        if !stream.fence.is_signaled() {
            self.stats.lock().blocked_waits += 1;
        }
        stream.fence.wait()?;
        stream.reset();

        self.stats.lock().in_flight -= 1;
        Ok(())
    }

    /// Retire every in-flight batch
    pub fn wait_idle(&self) -> Result<()> {
        for stream in &self.streams {
            self.retire(&mut stream.lock())?;
        }
        Ok(())
    }

    /// Current state of every stream. A stream held by a live [`Data`] reports
    /// `Recording`.
    pub fn stream_states(&self) -> [StreamState; STREAM_COUNT] {
        std::array::from_fn(|index| {
            self.streams[index]
                .try_lock()
                .map_or(StreamState::Recording, |stream| stream.state)
        })
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.lock().clone()
    }

    pub fn staging(&self) -> &LinearAllocator {
        &self.staging
    }
}

impl fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadEngine")
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scoped acquisition of one [`DataStream`].
///
/// Recorded commands are submitted on [`commit`](Data::commit) or when the
/// scope ends, whichever happens first.
pub struct Data<'a> {
    engine: &'a UploadEngine,
    stream: MutexGuard<'a, DataStream>,
    committed: bool,
}

impl<'a> Data<'a> {
    pub fn stream_index(&self) -> usize {
        self.stream.index
    }

    pub fn command_count(&self) -> usize {
        self.stream.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.commands.is_empty()
    }

    fn record(&mut self, command: Command) -> Result<()> {
        if self.committed {
            return Err(TesseraError::invalid_argument(
                "recording into a committed upload stream",
            ));
        }
        self.stream.commands.push(command);
        Ok(())
    }

    /// Copy `size` bytes starting at `src_offset` inside `src` to `dst`.
    /// For surface targets `size` must cover every source row.
    pub fn copy(
        &mut self,
        dst: CopyTarget,
        src: &LinearAllocation,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src_start = src.range_offset(src_offset, size).ok_or_else(|| {
            range_error("copy", src_offset, size, src.size())
        })?;

        let command = match dst {
            CopyTarget::Buffer { memory, offset } => {
                self.check_buffer_copy("copy", src_start, offset, size)?;
                Command::CopyBuffer {
                    src: src.memory(),
                    src_offset: src_start,
                    dst: memory,
                    dst_offset: offset,
                    size,
                }
            }
            CopyTarget::Surface {
                surface,
                region,
                bytes_per_row,
            } => {
                let row_bytes = region.width as u64 * SURFACE_BYTES_PER_TEXEL as u64;
                let needed = match region.height {
                    0 => 0,
                    rows => bytes_per_row as u64 * (rows as u64 - 1) + row_bytes,
                };
                if (bytes_per_row as u64) < row_bytes || needed > size {
                    return Err(TesseraError::invalid_range_with_context(
                        format!(
                            "{} source bytes cannot fill region {:?} at pitch {}",
                            size, region, bytes_per_row
                        ),
                        ErrorContext::new("copy", "Data"),
                    ));
                }
                Command::CopyBufferToSurface {
                    src: src.memory(),
                    src_offset: src_start,
                    bytes_per_row,
                    dst: surface,
                    region,
                }
            }
        };
        self.record(command)
    }

    /// Range-checked buffer to buffer copy
    pub fn copy_buffer(
        &mut self,
        dst: &LinearAllocation,
        dst_offset: u64,
        src: &LinearAllocation,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let offset = dst.range_offset(dst_offset, size).ok_or_else(|| {
            range_error("copy_buffer", dst_offset, size, dst.size())
        })?;
        self.copy(
            CopyTarget::Buffer {
                memory: dst.memory(),
                offset,
            },
            src,
            src_offset,
            size,
        )
    }

    pub fn change_layout(
        &mut self,
        surface: SurfaceHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        mip_count: u32,
    ) -> Result<()> {
        self.record(Command::ChangeLayout {
            surface,
            old_layout,
            new_layout,
            mip_count,
        })
    }

    pub fn generate_mipmap(
        &mut self,
        surface: SurfaceHandle,
        width: u32,
        height: u32,
        mip_count: u32,
    ) -> Result<()> {
        self.record(Command::GenerateMipmap {
            surface,
            width,
            height,
            mip_count,
        })
    }

    /// Keep `resource` alive until this batch has finished executing
    pub fn hold<T: Any + Send>(&mut self, resource: T) {
        self.stream.retained.push(Box::new(resource));
    }

    /// Stage `bytes` and record their copy into `dst` at `dst_offset`
    pub fn write_buffer(&mut self, dst: &LinearAllocation, dst_offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        let offset = dst.range_offset(dst_offset, len).ok_or_else(|| {
            range_error("write_buffer", dst_offset, len, dst.size())
        })?;
        if bytes.is_empty() {
            return Ok(());
        }
        // staging ranges are already aligned
        self.check_buffer_copy("write_buffer", 0, offset, len)?;

        let staging = self.stage(bytes)?;
        self.record(Command::CopyBuffer {
            src: staging.memory(),
            src_offset: staging.offset(),
            dst: dst.memory(),
            dst_offset: offset,
            size: len,
        })?;
        self.hold(staging);
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, dst: &LinearAllocation, dst_offset: u64, values: &[T]) -> Result<()> {
        self.write_buffer(dst, dst_offset, bytemuck::cast_slice(values))
    }

    /// Stage tightly packed RGBA8 `texels` and record their copy into the atlas
    /// region of `dst`. The atlas placement is held until the copy retires.
    pub fn write_region(&mut self, dst: &AtlasAllocation, texels: &[u8]) -> Result<()> {
        let region = dst.region();
        let row_bytes = region.width as usize * SURFACE_BYTES_PER_TEXEL as usize;
        let expected = row_bytes * region.height as usize;
        if texels.len() != expected {
            return Err(TesseraError::invalid_range_with_context(
                format!(
                    "{} texel bytes for a {}x{} region, expected {}",
                    texels.len(),
                    region.width,
                    region.height,
                    expected
                ),
                ErrorContext::new("write_region", "Data"),
            ));
        }

        let alignment = self.engine.backend.copy_row_alignment().max(1) as u64;
        let pitch = align_up(row_bytes as u64, alignment) as usize;
        let staging = if pitch == row_bytes {
            self.stage(texels)?
        } else {
            let mut padded = vec![0u8; pitch * region.height as usize];
            for (row, line) in texels.chunks_exact(row_bytes).enumerate() {
                padded[row * pitch..row * pitch + row_bytes].copy_from_slice(line);
            }
            self.stage(&padded)?
        };

        self.record(Command::CopyBufferToSurface {
            src: staging.memory(),
            src_offset: staging.offset(),
            bytes_per_row: pitch as u32,
            dst: dst.memory(),
            region,
        })?;
        self.hold(staging);
        self.hold(dst.clone());
        Ok(())
    }

    /// Buffer copies must start and end on the backend's copy alignment
    fn check_buffer_copy(&self, operation: &str, src_offset: u64, dst_offset: u64, size: u64) -> Result<()> {
        let alignment = self.engine.backend.copy_buffer_alignment().max(1);
        if src_offset % alignment == 0 && dst_offset % alignment == 0 && size % alignment == 0 {
            return Ok(());
        }
        Err(TesseraError::invalid_range_with_context(
            format!(
                "{} bytes from {} to {} break the {} byte copy alignment",
                size, src_offset, dst_offset, alignment
            ),
            ErrorContext::new(operation, "Data").with_metadata("alignment", alignment),
        ))
    }

    fn stage(&mut self, bytes: &[u8]) -> Result<LinearAllocation> {
        if self.committed {
            return Err(TesseraError::invalid_argument(
                "staging into a committed upload stream",
            ));
        }
        // padded so backends that round writes up stay inside the range
        let alignment = self.engine.backend.copy_buffer_alignment().max(1);
        let staging = self.engine.staging.alloc(
            align_up(bytes.len() as u64, alignment),
            STAGING_ALIGNMENT.max(alignment),
            MemoryKind::Staging,
        )?;
        self.engine
            .backend
            .write_memory(staging.memory(), staging.offset(), bytes)?;
        self.engine.stats.lock().bytes_staged += bytes.len() as u64;
        Ok(staging)
    }

    /// Submit the recorded commands. A second call, or a call with nothing
    /// recorded, submits nothing.
    pub fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;

        if self.stream.commands.is_empty() {
            self.stream.reset();
            self.engine.stats.lock().empty_commits += 1;
            return Ok(());
        }

        let stream = &mut *self.stream;
        stream.fence.reset();
        let submission = SubmitInfo::new(&stream.commands).fence(stream.fence.handle());
        if let Err(err) = self.engine.backend.submit(&submission) {
            stream.reset();
            self.engine.stats.lock().failed_submissions += 1;
            return Err(err);
        }
        stream.state = StreamState::Waiting;

        let mut stats = self.engine.stats.lock();
        stats.submissions += 1;
        stats.in_flight += 1;
        stats.peak_in_flight = stats.peak_in_flight.max(stats.in_flight);
        tessera_debug!(
            LogCategory::Upload,
            "Submitted {} upload commands on stream {} ({} in flight)",
            stream.commands.len(),
            stream.index,
            stats.in_flight
        );
        Ok(())
    }
}

impl Drop for Data<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.commit() {
            tessera_error_rate_limited!(
                LogCategory::Upload,
                "Upload batch lost: {}",
                err.format_for_log()
            );
        }
    }
}

fn range_error(operation: &str, offset: u64, len: u64, size: u64) -> TesseraError {
    TesseraError::invalid_range_with_context(
        format!(
            "{} bytes at offset {} exceed an allocation of {} bytes",
            len, offset, size
        ),
        ErrorContext::new(operation, "Data"),
    )
}

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment.is_power_of_two() {
        align_offset(value, alignment)
    } else {
        value.div_ceil(alignment) * alignment
    }
}
