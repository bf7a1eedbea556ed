//! GPU readback backends
//!
//! The ring and the device talk to the GPU only through [`ReadbackGpu`]. `GlowGpu` drives a
//! real GL context; `HeadlessGpu` keeps software framebuffers so the whole pipeline can run
//! without one.

mod gl;
mod headless;

pub use self::gl::GlowGpu;
pub use self::headless::{GpuOp, HeadlessGpu};

use crate::error::DeviceError;

/// GPU pixel-pack buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackBuffer(pub u32);

/// Framebuffer object name. `0` is the default framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

/// Layouts the GPU is asked to pack pixels into. All of them are 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Rgba8,
    Bgra8,
    /// `UNSIGNED_INT_10_10_10_2`: red in the high bits.
    Rgb10A2,
    /// `UNSIGNED_INT_2_10_10_10_REV`: red in the low bits.
    Rgb10A2Rev,
}

impl PixelLayout {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn gl_format(self) -> u32 {
        match self {
            PixelLayout::Bgra8 => glow::BGRA,
            _ => glow::RGBA,
        }
    }

    pub fn gl_type(self) -> u32 {
        match self {
            PixelLayout::Rgba8 | PixelLayout::Bgra8 => glow::UNSIGNED_BYTE,
            PixelLayout::Rgb10A2 => glow::UNSIGNED_INT_10_10_10_2,
            PixelLayout::Rgb10A2Rev => glow::UNSIGNED_INT_2_10_10_10_REV,
        }
    }
}

/// Result of a scoped map of a pack buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// Mapped, visited, unmapped.
    Unmapped,
    /// Could not map; the visitor was not called.
    MapFailed,
    /// The visitor ran but the buffer is still mapped.
    UnmapFailed,
}

/// Operations the readback pipeline needs from a GPU context.
///
/// Calls happen on the thread that owns the context, in the order the pipeline issues them.
pub trait ReadbackGpu {
    fn create_pack_buffer(&mut self, bytes: usize) -> Result<PackBuffer, DeviceError>;
    fn delete_pack_buffer(&mut self, buffer: PackBuffer);

    /// Make `fbo` the source of subsequent reads and hold it until `end_readback`.
    fn begin_readback(&mut self, fbo: FramebufferId);
    fn end_readback(&mut self, fbo: FramebufferId);

    /// Queue an asynchronous read of the current source into `buffer`. Returns immediately.
    fn read_to_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        width: usize,
        height: usize,
        layout: PixelLayout,
    ) -> Result<(), DeviceError>;

    /// Map `bytes` of `buffer` for reading, hand them to `visit`, then unmap.
    fn map_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        bytes: usize,
        visit: &mut dyn FnMut(&[u8]),
    ) -> MapOutcome;

    /// Retry an unmap that failed earlier. Returns true once the buffer is unmapped.
    fn unmap_pack_buffer(&mut self, buffer: PackBuffer) -> bool;

    /// Blocking read of the current source into CPU memory.
    fn read_pixels(
        &mut self,
        width: usize,
        height: usize,
        layout: PixelLayout,
        dst: &mut [u8],
    ) -> Result<(), DeviceError>;

    /// Wait for all queued GPU work. Diagnostic only.
    fn finish(&mut self);
}
