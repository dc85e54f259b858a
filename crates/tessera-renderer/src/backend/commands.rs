use super::{FramebufferHandle, MemoryHandle, SurfaceHandle};
use tessera_core::Region;

/// Layout a surface is in, as far as transfer and sampling are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    ColorAttachment,
    Present,
}

/// Destination of a copy out of a memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTarget {
    Buffer {
        memory: MemoryHandle,
        offset: u64,
    },
    Surface {
        surface: SurfaceHandle,
        region: Region,
        /// Source row pitch in bytes
        bytes_per_row: u32,
    },
}

/// Backend-agnostic commands recorded by the upload engine and the frame recorder.
/// Within one list commands execute in recording order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer {
        src: MemoryHandle,
        src_offset: u64,
        dst: MemoryHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToSurface {
        src: MemoryHandle,
        src_offset: u64,
        bytes_per_row: u32,
        dst: SurfaceHandle,
        region: Region,
    },
    ChangeLayout {
        surface: SurfaceHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        mip_count: u32,
    },
    GenerateMipmap {
        surface: SurfaceHandle,
        width: u32,
        height: u32,
        mip_count: u32,
    },
    BeginRenderPass {
        framebuffer: FramebufferHandle,
        clear_color: Option<[f32; 4]>,
    },
    EndRenderPass,
}

impl Command {
    /// Whether the command only moves data between resources
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Command::CopyBuffer { .. }
                | Command::CopyBufferToSurface { .. }
                | Command::ChangeLayout { .. }
                | Command::GenerateMipmap { .. }
        )
    }
}
