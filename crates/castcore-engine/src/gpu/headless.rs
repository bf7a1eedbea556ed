//! Software GPU.
//!
//! Framebuffers are RGBA8 arrays stored bottom row first, as GL reads them. Reads into
//! pack buffers complete immediately; the pipeline still consumes them one frame later.
//! Every call is appended to an operation log so tests can check ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{FramebufferId, MapOutcome, PackBuffer, PixelLayout, ReadbackGpu};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOp {
    CreateBuffer(PackBuffer),
    DeleteBuffer(PackBuffer),
    BeginReadback(FramebufferId),
    EndReadback(FramebufferId),
    ReadToBuffer { buffer: PackBuffer, fbo: FramebufferId, layout: PixelLayout },
    Map(PackBuffer),
    Unmap(PackBuffer),
    ReadPixels { fbo: FramebufferId, layout: PixelLayout },
    Finish,
}

#[derive(Debug)]
struct Framebuffer {
    width: usize,
    height: usize,
    rgba: Vec<u8>,
}

#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    mapped: bool,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_fbo: u32,
    next_buffer: u32,
    framebuffers: HashMap<FramebufferId, Framebuffer>,
    buffers: HashMap<PackBuffer, Buffer>,
    read_fbo: Option<FramebufferId>,
    holds: HashMap<FramebufferId, usize>,
    ops: Vec<GpuOp>,
    fail_unmap: bool,
}

fn source<'a>(
    read_fbo: Option<FramebufferId>,
    framebuffers: &'a HashMap<FramebufferId, Framebuffer>,
    op: &'static str,
) -> Result<(FramebufferId, &'a Framebuffer), DeviceError> {
    let fbo = read_fbo.ok_or(DeviceError::Gpu { op, msg: "no read framebuffer bound".into() })?;
    let fb = framebuffers
        .get(&fbo)
        .ok_or_else(|| DeviceError::Gpu { op, msg: format!("unknown framebuffer {}", fbo.0) })?;
    Ok((fbo, fb))
}

/// Cloneable handle; clones share the same framebuffers and buffers.
#[derive(Debug, Clone, Default)]
pub struct HeadlessGpu {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessGpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_framebuffer(&self, width: usize, height: usize) -> FramebufferId {
        let mut st = self.lock();
        st.next_fbo += 1;
        let id = FramebufferId(st.next_fbo);
        st.framebuffers.insert(id, Framebuffer { width, height, rgba: vec![0; width * height * 4] });
        id
    }

    pub fn fill(&self, fbo: FramebufferId, rgba: [u8; 4]) {
        self.paint(fbo, |_, _| rgba);
    }

    /// Set every pixel from `f(x, y)`, with `y` counted from the top row.
    pub fn paint(&self, fbo: FramebufferId, mut f: impl FnMut(usize, usize) -> [u8; 4]) {
        let mut st = self.lock();
        let Some(fb) = st.framebuffers.get_mut(&fbo) else {
            return;
        };
        let (w, h) = (fb.width, fb.height);
        for y in 0..h {
            let row = h - 1 - y;
            for x in 0..w {
                let o = (row * w + x) * 4;
                fb.rgba[o..o + 4].copy_from_slice(&f(x, y));
            }
        }
    }

    pub fn ops(&self) -> Vec<GpuOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Make every unmap fail until switched back.
    pub fn set_fail_unmap(&self, fail: bool) {
        self.lock().fail_unmap = fail;
    }

    pub fn is_held(&self, fbo: FramebufferId) -> bool {
        self.lock().holds.get(&fbo).copied().unwrap_or(0) > 0
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn mapped_buffers(&self) -> usize {
        self.lock().buffers.values().filter(|b| b.mapped).count()
    }
}

fn expand10(c: u8) -> u32 {
    ((c as u32) << 2) | ((c as u32) >> 6)
}

/// Pack the lower-left `width x height` region of `fb` into `dst` in `layout`.
fn pack(fb: &Framebuffer, width: usize, height: usize, layout: PixelLayout, dst: &mut [u8]) {
    for row in 0..height {
        for x in 0..width {
            let o = (row * width + x) * 4;
            if o + 4 > dst.len() {
                return;
            }
            let px = if row < fb.height && x < fb.width {
                let i = (row * fb.width + x) * 4;
                [fb.rgba[i], fb.rgba[i + 1], fb.rgba[i + 2], fb.rgba[i + 3]]
            } else {
                [0; 4]
            };
            let [r, g, b, a] = px;
            let out = match layout {
                PixelLayout::Rgba8 => px,
                PixelLayout::Bgra8 => [b, g, r, a],
                PixelLayout::Rgb10A2Rev => {
                    (expand10(r) | (expand10(g) << 10) | (expand10(b) << 20) | (((a >> 6) as u32) << 30)).to_le_bytes()
                }
                PixelLayout::Rgb10A2 => {
                    ((expand10(r) << 22) | (expand10(g) << 12) | (expand10(b) << 2) | (a >> 6) as u32).to_le_bytes()
                }
            };
            dst[o..o + 4].copy_from_slice(&out);
        }
    }
}

impl ReadbackGpu for HeadlessGpu {
    fn create_pack_buffer(&mut self, bytes: usize) -> Result<PackBuffer, DeviceError> {
        let mut st = self.lock();
        st.next_buffer += 1;
        let id = PackBuffer(st.next_buffer);
        st.buffers.insert(id, Buffer { data: vec![0; bytes], mapped: false });
        st.ops.push(GpuOp::CreateBuffer(id));
        Ok(id)
    }

    fn delete_pack_buffer(&mut self, buffer: PackBuffer) {
        let mut st = self.lock();
        st.buffers.remove(&buffer);
        st.ops.push(GpuOp::DeleteBuffer(buffer));
    }

    fn begin_readback(&mut self, fbo: FramebufferId) {
        let mut st = self.lock();
        st.read_fbo = Some(fbo);
        *st.holds.entry(fbo).or_insert(0) += 1;
        st.ops.push(GpuOp::BeginReadback(fbo));
    }

    fn end_readback(&mut self, fbo: FramebufferId) {
        let mut st = self.lock();
        if let Some(n) = st.holds.get_mut(&fbo) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                st.holds.remove(&fbo);
            }
        }
        st.ops.push(GpuOp::EndReadback(fbo));
    }

    fn read_to_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        width: usize,
        height: usize,
        layout: PixelLayout,
    ) -> Result<(), DeviceError> {
        const OP: &str = "read_pixels (pack buffer)";
        let mut guard = self.lock();
        let st = &mut *guard;
        let (fbo, fb) = source(st.read_fbo, &st.framebuffers, OP)?;
        let buf = st
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| DeviceError::Gpu { op: OP, msg: format!("unknown buffer {}", buffer.0) })?;
        if buf.mapped {
            return Err(DeviceError::Gpu { op: OP, msg: format!("buffer {} is mapped", buffer.0) });
        }
        pack(fb, width, height, layout, &mut buf.data);
        st.ops.push(GpuOp::ReadToBuffer { buffer, fbo, layout });
        Ok(())
    }

    fn map_pack_buffer(
        &mut self,
        buffer: PackBuffer,
        bytes: usize,
        visit: &mut dyn FnMut(&[u8]),
    ) -> MapOutcome {
        let mut guard = self.lock();
        let st = &mut *guard;
        let Some(buf) = st.buffers.get_mut(&buffer) else {
            return MapOutcome::MapFailed;
        };
        if buf.mapped {
            return MapOutcome::MapFailed;
        }
        buf.mapped = true;
        st.ops.push(GpuOp::Map(buffer));
        let n = bytes.min(buf.data.len());
        visit(&buf.data[..n]);
        if st.fail_unmap {
            return MapOutcome::UnmapFailed;
        }
        buf.mapped = false;
        st.ops.push(GpuOp::Unmap(buffer));
        MapOutcome::Unmapped
    }

    fn unmap_pack_buffer(&mut self, buffer: PackBuffer) -> bool {
        let mut st = self.lock();
        if st.fail_unmap {
            return false;
        }
        if let Some(buf) = st.buffers.get_mut(&buffer) {
            buf.mapped = false;
        }
        st.ops.push(GpuOp::Unmap(buffer));
        true
    }

    fn read_pixels(
        &mut self,
        width: usize,
        height: usize,
        layout: PixelLayout,
        dst: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let (fbo, fb) = source(st.read_fbo, &st.framebuffers, "read_pixels")?;
        pack(fb, width, height, layout, dst);
        st.ops.push(GpuOp::ReadPixels { fbo, layout });
        Ok(())
    }

    fn finish(&mut self) {
        self.lock().ops.push(GpuOp::Finish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_come_back_bottom_row_first() {
        let mut gpu = HeadlessGpu::new();
        let fbo = gpu.create_framebuffer(1, 2);
        gpu.paint(fbo, |_, y| if y == 0 { [1, 2, 3, 4] } else { [5, 6, 7, 8] });

        gpu.begin_readback(fbo);
        let mut out = [0u8; 8];
        gpu.read_pixels(1, 2, PixelLayout::Rgba8, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8, 1, 2, 3, 4]);

        gpu.read_pixels(1, 1, PixelLayout::Bgra8, &mut out[..4]).unwrap();
        assert_eq!(&out[..4], &[7, 6, 5, 8]);
    }

    #[test]
    fn ten_bit_layouts_expand_full_scale() {
        let mut gpu = HeadlessGpu::new();
        let fbo = gpu.create_framebuffer(1, 1);
        gpu.fill(fbo, [255, 0, 0, 255]);
        gpu.begin_readback(fbo);

        let mut out = [0u8; 4];
        gpu.read_pixels(1, 1, PixelLayout::Rgb10A2Rev, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 0x3ff | (3 << 30));
        gpu.read_pixels(1, 1, PixelLayout::Rgb10A2, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), (0x3ff << 22) | 3);
        assert_eq!(gpu.ops()[1], GpuOp::ReadPixels { fbo, layout: PixelLayout::Rgb10A2Rev });
    }

    #[test]
    fn mapped_buffer_refuses_reads_until_unmapped() {
        let mut gpu = HeadlessGpu::new();
        let fbo = gpu.create_framebuffer(2, 2);
        let buf = gpu.create_pack_buffer(16).unwrap();
        gpu.begin_readback(fbo);
        gpu.set_fail_unmap(true);

        assert_eq!(gpu.map_pack_buffer(buf, 16, &mut |_: &[u8]| {}), MapOutcome::UnmapFailed);
        assert_eq!(gpu.mapped_buffers(), 1);
        assert!(gpu.read_to_pack_buffer(buf, 2, 2, PixelLayout::Rgba8).is_err());
        assert_eq!(gpu.map_pack_buffer(buf, 16, &mut |_: &[u8]| {}), MapOutcome::MapFailed);

        gpu.set_fail_unmap(false);
        assert!(gpu.unmap_pack_buffer(buf));
        assert!(gpu.read_to_pack_buffer(buf, 2, 2, PixelLayout::Rgba8).is_ok());
    }

    #[test]
    fn holds_are_counted() {
        let mut gpu = HeadlessGpu::new();
        let fbo = gpu.create_framebuffer(1, 1);
        gpu.begin_readback(fbo);
        gpu.begin_readback(fbo);
        gpu.end_readback(fbo);
        assert!(gpu.is_held(fbo));
        gpu.end_readback(fbo);
        assert!(!gpu.is_held(fbo));
    }
}
