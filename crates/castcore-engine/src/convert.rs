//! Pixel conversion
//!
//! Stateless routines turning GPU readback layouts (4 bytes per pixel, rows bottom-up) into
//! wire layouts. YCbCr output uses BT.709 coefficients at studio range.
//!
//! Inputs are tightly packed (`width * 4` bytes per row). Outputs use the wire stride of the
//! target format.

use crate::formats::DataFormat;
use crate::gpu::PixelLayout;

/// CPU pass applied after readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Readback bytes are already wire bytes.
    Copy,
    /// `2_10_10_10_REV` words to big-endian `10_10_10_2` words.
    ReorderRgb10,
    /// RGBA8 to 8-bit 4:2:2 UYVY.
    Uyvy8,
    /// `2_10_10_10_REV` words to v210.
    V210,
}

const V210_BLACK_CHROMA_FIRST: u32 = 512 | (64 << 10) | (512 << 20);
const V210_BLACK_LUMA_FIRST: u32 = 64 | (512 << 10) | (64 << 20);

/// Everything the transfer path needs to know about one frame geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPlan {
    pub width: usize,
    pub height: usize,
    /// Layout requested from the GPU.
    pub readback: PixelLayout,
    pub conversion: Conversion,
    /// Output bytes per row.
    pub out_stride: usize,
}

impl ConversionPlan {
    pub fn new(format: DataFormat, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            readback: format.readback_layout(),
            conversion: format.conversion(),
            out_stride: format.bytes_per_line(width),
        }
    }

    /// Readback is always four bytes per pixel, whatever the wire format.
    pub fn readback_bytes(&self) -> usize {
        self.width * PixelLayout::BYTES_PER_PIXEL * self.height
    }

    pub fn output_bytes(&self) -> usize {
        self.out_stride * self.height
    }

    pub fn needs_conversion(&self) -> bool {
        self.conversion != Conversion::Copy
    }

    /// A frame that shows black (grey for 8-bit 4:2:2) on the receiver, used to fill output
    /// slots before their first conversion.
    pub fn blank_frame(&self) -> Vec<u8> {
        let bytes = self.output_bytes();
        match self.conversion {
            Conversion::Copy | Conversion::ReorderRgb10 => vec![0; bytes],
            Conversion::Uyvy8 => vec![128; bytes],
            Conversion::V210 => {
                // Cb Y Cr | Y Cb Y, repeated; rows are whole 128-byte blocks
                let pair = [V210_BLACK_CHROMA_FIRST, V210_BLACK_LUMA_FIRST];
                pair.iter().flat_map(|w| w.to_le_bytes()).cycle().take(bytes).collect()
            }
        }
    }

    /// Convert one readback frame into `dst`.
    pub fn apply(&self, src: &[u8], dst: &mut [u8]) {
        let (w, h) = (self.width, self.height);
        match self.conversion {
            Conversion::Copy => copy_frame(src, dst),
            Conversion::ReorderRgb10 => reorder_abgr10_to_rgba10(w, h, src, dst),
            Conversion::Uyvy8 => subsample_422_8bit_uyvy(w, h, src, dst),
            Conversion::V210 => subsample_422_10bit_v210(w, h, src, dst, self.out_stride),
        }
    }
}

/// Plain copy of as many bytes as both buffers hold.
pub fn copy_frame(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn word_le(src: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]])
}

/// Split a `2_10_10_10_REV` word into (r, g, b, a).
fn unpack_rev10(p: u32) -> (u32, u32, u32, u32) {
    (p & 0x3ff, (p >> 10) & 0x3ff, (p >> 20) & 0x3ff, p >> 30)
}

/// `2_10_10_10_REV` (red in the low bits) to `10_10_10_2` (red in the high bits),
/// stored big-endian as the wire expects.
pub fn reorder_abgr10_to_rgba10(width: usize, height: usize, src: &[u8], dst: &mut [u8]) {
    let pixels = (width * height).min(src.len() / 4).min(dst.len() / 4);
    for i in 0..pixels {
        let (r, g, b, a) = unpack_rev10(word_le(src, i * 4));
        let out = (r << 22) | (g << 12) | (b << 2) | (a & 0x3);
        dst[i * 4..i * 4 + 4].copy_from_slice(&out.to_be_bytes());
    }
}

/// BT.709 luma and colour differences for normalized RGB.
/// Returns (y in 0..1, cb and cr in -0.5..0.5).
fn ycbcr709(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    const KR: f32 = 0.2126;
    const KB: f32 = 0.0722;
    let y = KR * r + (1.0 - KR - KB) * g + KB * b;
    let cb = (b - y) / (2.0 * (1.0 - KB));
    let cr = (r - y) / (2.0 * (1.0 - KR));
    (y, cb, cr)
}

fn quantize(v: f32, offset: f32, range: f32, max: f32) -> f32 {
    (offset + range * v).round().clamp(0.0, max)
}

/// RGBA8 to UYVY. Each output pair averages the chroma of its two pixels; an odd last
/// pixel is paired with itself.
pub fn subsample_422_8bit_uyvy(width: usize, height: usize, src: &[u8], dst: &mut [u8]) {
    let in_stride = width * 4;
    let out_stride = width * 2;
    if width == 0 || src.len() < in_stride * height || dst.len() < out_stride * height {
        return;
    }

    for row in 0..height {
        let s = &src[row * in_stride..(row + 1) * in_stride];
        let d = &mut dst[row * out_stride..(row + 1) * out_stride];
        for pair in 0..width.div_ceil(2) {
            let x0 = pair * 2;
            let x1 = (x0 + 1).min(width - 1);
            let px = |x: usize| {
                ycbcr709(s[x * 4] as f32 / 255.0, s[x * 4 + 1] as f32 / 255.0, s[x * 4 + 2] as f32 / 255.0)
            };
            let (y0, cb0, cr0) = px(x0);
            let (y1, cb1, cr1) = px(x1);

            let o = pair * 4;
            d[o] = quantize((cb0 + cb1) * 0.5, 128.0, 224.0, 255.0) as u8;
            d[o + 1] = quantize(y0, 16.0, 219.0, 255.0) as u8;
            if o + 2 < d.len() {
                d[o + 2] = quantize((cr0 + cr1) * 0.5, 128.0, 224.0, 255.0) as u8;
            }
            if o + 3 < d.len() {
                d[o + 3] = quantize(y1, 16.0, 219.0, 255.0) as u8;
            }
        }
    }
}

/// `2_10_10_10_REV` to v210: groups of six pixels in four little-endian words
/// (`Cb0 Y0 Cr0 | Y1 Cb1 Y2 | Cr1 Y3 Cb2 | Y4 Cr2 Y5`). A partial last group repeats the
/// final pixel.
pub fn subsample_422_10bit_v210(width: usize, height: usize, src: &[u8], dst: &mut [u8], out_stride: usize) {
    let in_stride = width * 4;
    if width == 0 || src.len() < in_stride * height || dst.len() < out_stride * height {
        return;
    }

    for row in 0..height {
        let s = &src[row * in_stride..(row + 1) * in_stride];
        let d = &mut dst[row * out_stride..(row + 1) * out_stride];

        let sample = |x: usize| {
            let (r, g, b, _) = unpack_rev10(word_le(s, x.min(width - 1) * 4));
            ycbcr709(r as f32 / 1023.0, g as f32 / 1023.0, b as f32 / 1023.0)
        };

        for group in 0..width.div_ceil(6) {
            let mut y = [0u32; 6];
            let mut cb = [0u32; 3];
            let mut cr = [0u32; 3];
            for p in 0..3 {
                let (ya, cba, cra) = sample(group * 6 + p * 2);
                let (yb, cbb, crb) = sample(group * 6 + p * 2 + 1);
                y[p * 2] = quantize(ya, 64.0, 876.0, 1023.0) as u32;
                y[p * 2 + 1] = quantize(yb, 64.0, 876.0, 1023.0) as u32;
                cb[p] = quantize((cba + cbb) * 0.5, 512.0, 896.0, 1023.0) as u32;
                cr[p] = quantize((cra + crb) * 0.5, 512.0, 896.0, 1023.0) as u32;
            }

            let words = [
                cb[0] | (y[0] << 10) | (cr[0] << 20),
                y[1] | (cb[1] << 10) | (y[2] << 20),
                cr[1] | (y[3] << 10) | (cb[2] << 20),
                y[4] | (cr[2] << 10) | (y[5] << 20),
            ];
            for (k, w) in words.iter().enumerate() {
                let o = group * 16 + k * 4;
                d[o..o + 4].copy_from_slice(&w.to_le_bytes());
            }
        }
    }
}

/// Copy `rows` rows of `line_bytes` from `src` into `dst` in reverse row order.
pub fn flip_rows(src: &[u8], dst: &mut [u8], line_bytes: usize, rows: usize) {
    if line_bytes == 0 || src.len() < line_bytes * rows || dst.len() < line_bytes * rows {
        return;
    }
    for row in 0..rows {
        let from = (rows - 1 - row) * line_bytes;
        dst[row * line_bytes..(row + 1) * line_bytes].copy_from_slice(&src[from..from + line_bytes]);
    }
}

/// Bytes of a P216 frame: a 16-bit luma plane followed by an interleaved 16-bit CbCr plane.
pub fn p216_bytes(width: usize, height: usize) -> usize {
    width * 2 * height + width.div_ceil(2) * 4 * height
}

/// v210 to P216 (samples scaled from 10 to 16 bits).
pub fn v210_to_p216(width: usize, height: usize, src: &[u8], src_stride: usize, dst: &mut [u8]) {
    let chroma_pairs = width.div_ceil(2);
    let luma_bytes = width * 2 * height;
    if src.len() < src_stride * height || dst.len() < p216_bytes(width, height) {
        return;
    }
    let (luma, chroma) = dst.split_at_mut(luma_bytes);

    for row in 0..height {
        let s = &src[row * src_stride..(row + 1) * src_stride];
        let mut ys = Vec::with_capacity(width + 6);
        let mut cbcr = Vec::with_capacity(chroma_pairs * 2 + 6);
        for group in 0..width.div_ceil(6) {
            let mut v = [0u16; 12];
            for k in 0..4 {
                let w = word_le(s, group * 16 + k * 4);
                for j in 0..3 {
                    v[k * 3 + j] = ((w >> (10 * j)) & 0x3ff) as u16;
                }
            }
            ys.extend([v[1], v[3], v[5], v[7], v[9], v[11]]);
            cbcr.extend([v[0], v[2], v[4], v[6], v[8], v[10]]);
        }

        for x in 0..width {
            let o = (row * width + x) * 2;
            luma[o..o + 2].copy_from_slice(&(ys[x] << 6).to_le_bytes());
        }
        for c in 0..chroma_pairs * 2 {
            let o = (row * chroma_pairs * 2 + c) * 2;
            chroma[o..o + 2].copy_from_slice(&(cbcr[c] << 6).to_le_bytes());
        }
    }
}

/// Big-endian `10_10_10_2` words down to RGBA8 (alpha forced opaque).
pub fn rgb10_to_rgba8(width: usize, height: usize, src: &[u8], dst: &mut [u8]) {
    let pixels = (width * height).min(src.len() / 4).min(dst.len() / 4);
    for i in 0..pixels {
        let p = u32::from_be_bytes([src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]]);
        dst[i * 4] = ((p >> 22) >> 2) as u8;
        dst[i * 4 + 1] = (((p >> 12) & 0x3ff) >> 2) as u8;
        dst[i * 4 + 2] = (((p >> 2) & 0x3ff) >> 2) as u8;
        dst[i * 4 + 3] = 255;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(w: usize, h: usize, px: [u8; 4]) -> Vec<u8> {
        px.iter().copied().cycle().take(w * h * 4).collect()
    }

    fn rev10(r: u32, g: u32, b: u32, a: u32) -> [u8; 4] {
        (r | (g << 10) | (b << 20) | (a << 30)).to_le_bytes()
    }

    #[test]
    fn uyvy_white_and_black_hit_studio_range() {
        let mut out = vec![0u8; 4 * 2];
        subsample_422_8bit_uyvy(4, 1, &rgba(4, 1, [255, 255, 255, 255]), &mut out);
        assert_eq!(out, vec![128, 235, 128, 235, 128, 235, 128, 235]);

        subsample_422_8bit_uyvy(4, 1, &rgba(4, 1, [0, 0, 0, 255]), &mut out);
        assert_eq!(out, vec![128, 16, 128, 16, 128, 16, 128, 16]);
    }

    #[test]
    fn uyvy_red_has_high_cr() {
        let mut out = vec![0u8; 4];
        subsample_422_8bit_uyvy(2, 1, &rgba(2, 1, [255, 0, 0, 255]), &mut out);
        // BT.709 red: Y=63, Cb=102, Cr=240
        assert_eq!(out, vec![102, 63, 240, 63]);
    }

    #[test]
    fn uyvy_odd_width_pairs_last_pixel_with_itself() {
        let mut out = vec![0u8; 3 * 2];
        subsample_422_8bit_uyvy(3, 1, &rgba(3, 1, [255, 255, 255, 255]), &mut out);
        assert_eq!(&out[..4], &[128, 235, 128, 235]);
        assert_eq!(&out[4..], &[128, 235]);
    }

    #[test]
    fn v210_packs_white_group() {
        let width = 6;
        let src: Vec<u8> = (0..width).flat_map(|_| rev10(1023, 1023, 1023, 3)).collect();
        let stride = DataFormat::Yuv422_10.bytes_per_line(width);
        assert_eq!(stride, 128);
        let mut out = vec![0u8; stride];
        subsample_422_10bit_v210(width, 1, &src, &mut out, stride);

        let w0 = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(w0, 512 | (940 << 10) | (512 << 20));
        let w1 = u32::from_le_bytes([out[4], out[5], out[6], out[7]]);
        assert_eq!(w1, 940 | (512 << 10) | (940 << 20));
        // remainder of the 128-byte block untouched
        assert!(out[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn v210_round_trips_through_p216() {
        let width = 8;
        let height = 2;
        let src: Vec<u8> = (0..width * height).flat_map(|_| rev10(0, 0, 0, 3)).collect();
        let stride = DataFormat::Yuv422_10.bytes_per_line(width);
        let mut packed = vec![0u8; stride * height];
        subsample_422_10bit_v210(width, height, &src, &mut packed, stride);

        let mut p216 = vec![0u8; p216_bytes(width, height)];
        v210_to_p216(width, height, &packed, stride, &mut p216);
        let y0 = u16::from_le_bytes([p216[0], p216[1]]);
        assert_eq!(y0, 64 << 6);
        let luma_bytes = width * 2 * height;
        let cb0 = u16::from_le_bytes([p216[luma_bytes], p216[luma_bytes + 1]]);
        assert_eq!(cb0, 512 << 6);
    }

    #[test]
    fn abgr10_reorders_into_big_endian_rgba10() {
        let src = rev10(0x3ff, 0x155, 0x001, 0b10);
        let mut out = [0u8; 4];
        reorder_abgr10_to_rgba10(1, 1, &src, &mut out);
        let expected: u32 = (0x3ff << 22) | (0x155 << 12) | (0x001 << 2) | 0b10;
        assert_eq!(out, expected.to_be_bytes());

        let mut back = [0u8; 4];
        rgb10_to_rgba8(1, 1, &out, &mut back);
        assert_eq!(back, [255, 0x55, 0, 255]);
    }

    #[test]
    fn flip_reverses_rows() {
        let src = vec![1, 1, 2, 2, 3, 3];
        let mut dst = vec![0; 6];
        flip_rows(&src, &mut dst, 2, 3);
        assert_eq!(dst, vec![3, 3, 2, 2, 1, 1]);
    }

    #[test]
    fn blank_frames_decode_to_black() {
        let uyvy = ConversionPlan::new(DataFormat::Uyvy8, 4, 2).blank_frame();
        assert_eq!(uyvy.len(), 16);
        assert!(uyvy.iter().all(|&b| b == 128));

        assert!(ConversionPlan::new(DataFormat::Rgba8, 4, 2).blank_frame().iter().all(|&b| b == 0));
        assert!(ConversionPlan::new(DataFormat::Rgb10, 4, 2).blank_frame().iter().all(|&b| b == 0));

        let plan = ConversionPlan::new(DataFormat::Yuv422_10, 6, 2);
        let v210 = plan.blank_frame();
        assert_eq!(v210.len(), 256);
        let mut p216 = vec![0u8; p216_bytes(6, 2)];
        v210_to_p216(6, 2, &v210, plan.out_stride, &mut p216);
        let luma = 6 * 2 * 2;
        for px in 0..6 * 2 {
            assert_eq!(u16::from_le_bytes([p216[px * 2], p216[px * 2 + 1]]), 64 << 6);
        }
        for c in 0..(p216.len() - luma) / 2 {
            let i = luma + c * 2;
            assert_eq!(u16::from_le_bytes([p216[i], p216[i + 1]]), 512 << 6);
        }
    }

    #[test]
    fn plan_sizes_follow_format() {
        let plan = ConversionPlan::new(DataFormat::Uyvy8, 1920, 1080);
        assert_eq!(plan.readback, PixelLayout::Rgba8);
        assert_eq!(plan.readback_bytes(), 1920 * 4 * 1080);
        assert_eq!(plan.output_bytes(), 1920 * 2 * 1080);
        assert!(plan.needs_conversion());
        assert!(!ConversionPlan::new(DataFormat::Bgra8, 8, 8).needs_conversion());
    }
}
