// GL readback through glow: PIXEL_PACK_BUFFER objects filled by glReadPixels with a
// buffer offset as destination, mapped read-only one frame later.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use glow::HasContext;

use super::{FramebufferId, MapOutcome, PackBuffer, PixelLayout, ReadbackGpu};
use crate::error::DeviceError;

pub struct GlowGpu {
    gl: Arc<glow::Context>,
    read_fbo: Option<FramebufferId>,
    // Outstanding readbacks per framebuffer; the read binding is dropped when the bound
    // one reaches zero.
    holds: HashMap<FramebufferId, usize>,
}

impl GlowGpu {
    /// The context must be current on the calling thread for every call.
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self { gl, read_fbo: None, holds: HashMap::new() }
    }

    pub fn context(&self) -> &Arc<glow::Context> {
        &self.gl
    }

    fn native_buffer(buffer: PackBuffer) -> Option<glow::NativeBuffer> {
        NonZeroU32::new(buffer.0).map(glow::NativeBuffer)
    }

    fn native_framebuffer(fbo: FramebufferId) -> Option<glow::NativeFramebuffer> {
        NonZeroU32::new(fbo.0).map(glow::NativeFramebuffer)
    }

    fn check(&self, op: &'static str) -> Result<(), DeviceError> {
        let err = unsafe { self.gl.get_error() };
        if err == glow::NO_ERROR {
            Ok(())
        } else {
            Err(DeviceError::Gpu { op, msg: format!("GL error 0x{err:04x}") })
        }
    }
}

impl ReadbackGpu for GlowGpu {
    fn create_pack_buffer(&mut self, bytes: usize) -> Result<PackBuffer, DeviceError> {
        let gl = &self.gl;
        unsafe {
            let buf = gl
                .create_buffer()
                .map_err(|msg| DeviceError::Gpu { op: "create_buffer", msg })?;
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Some(buf));
            gl.buffer_data_size(glow::PIXEL_PACK_BUFFER, bytes as i32, glow::STREAM_READ);
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            if let Err(e) = self.check("buffer_data_size") {
                gl.delete_buffer(buf);
                return Err(e);
            }
            Ok(PackBuffer(buf.0.get()))
        }
    }

    fn delete_pack_buffer(&mut self, buffer: PackBuffer) {
        if let Some(buf) = Self::native_buffer(buffer) {
            unsafe { self.gl.delete_buffer(buf) };
        }
    }

    fn begin_readback(&mut self, fbo: FramebufferId) {
        unsafe {
            self.gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Self::native_framebuffer(fbo));
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 4);
        }
        self.read_fbo = Some(fbo);
        *self.holds.entry(fbo).or_insert(0) += 1;
    }

    fn end_readback(&mut self, fbo: FramebufferId) {
        let remaining = match self.holds.get_mut(&fbo) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => 0,
        };
        if remaining == 0 {
            self.holds.remove(&fbo);
        }
        if remaining == 0 && self.read_fbo == Some(fbo) {
            unsafe { self.gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None) };
            self.read_fbo = None;
        }
    }

    fn read_to_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        width: usize,
        height: usize,
        layout: PixelLayout,
    ) -> Result<(), DeviceError> {
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Self::native_buffer(buffer));
            gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                layout.gl_format(),
                layout.gl_type(),
                glow::PixelPackData::BufferOffset(0),
            );
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
        }
        self.check("read_pixels (pack buffer)")
    }

    fn map_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        bytes: usize,
        visit: &mut dyn FnMut(&[u8]),
    ) -> MapOutcome {
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Self::native_buffer(buffer));
            let ptr = gl.map_buffer_range(glow::PIXEL_PACK_BUFFER, 0, bytes as i32, glow::MAP_READ_BIT);
            if ptr.is_null() {
                gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
                return MapOutcome::MapFailed;
            }
            visit(std::slice::from_raw_parts(ptr as *const u8, bytes));
            gl.unmap_buffer(glow::PIXEL_PACK_BUFFER);
            let ok = gl.get_error() == glow::NO_ERROR;
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            if ok {
                MapOutcome::Unmapped
            } else {
                MapOutcome::UnmapFailed
            }
        }
    }

    fn unmap_pack_buffer(&mut self, buffer: PackBuffer) -> bool {
        let gl = &self.gl;
        unsafe {
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, Self::native_buffer(buffer));
            gl.unmap_buffer(glow::PIXEL_PACK_BUFFER);
            let ok = gl.get_error() == glow::NO_ERROR;
            gl.bind_buffer(glow::PIXEL_PACK_BUFFER, None);
            ok
        }
    }

    fn read_pixels(
        &mut self,
        width: usize,
        height: usize,
        layout: PixelLayout,
        dst: &mut [u8],
    ) -> Result<(), DeviceError> {
        let need = width * height * PixelLayout::BYTES_PER_PIXEL;
        if dst.len() < need {
            return Err(DeviceError::Gpu {
                op: "read_pixels",
                msg: format!("destination holds {} bytes, frame needs {need}", dst.len()),
            });
        }
        unsafe {
            self.gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                layout.gl_format(),
                layout.gl_type(),
                glow::PixelPackData::Slice(Some(&mut dst[..need])),
            );
        }
        self.check("read_pixels")
    }

    fn finish(&mut self) {
        unsafe { self.gl.finish() };
    }
}
