//! Format catalog
//!
//! Static tables of the video modes, wire pixel formats and audio formats the device can
//! emit, plus `FormatCatalog`, the per-device selection state over those tables.
//!
//! Selection policy: every index argument is clamped to `[0, count - 1]`. An out-of-range
//! index selects the last entry; it is never an error.

use std::cell::OnceCell;

use crate::audio::{self, AudioCadence, AUDIO_CADENCE_LEN};
use crate::convert::Conversion;
use crate::gpu::PixelLayout;

/// Canonical pixel formats the device can put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Rgba8,
    Bgra8,
    /// 8-bit 4:2:2, `Cb Y0 Cr Y1` byte order.
    Uyvy8,
    /// 10-bit 4:2:2, six pixels packed into four little-endian words (v210).
    Yuv422_10,
    /// 10-bit RGB in `10_10_10_2` order, one big-endian word per pixel.
    Rgb10,
}

impl DataFormat {
    /// Bytes in one output row for a frame `width` pixels wide.
    pub fn bytes_per_line(self, width: usize) -> usize {
        match self {
            DataFormat::Rgba8 | DataFormat::Bgra8 | DataFormat::Rgb10 => 4 * width,
            DataFormat::Uyvy8 => 2 * width,
            // 48 pixels per 128 bytes, rows padded to a whole block
            DataFormat::Yuv422_10 => 128 * width.div_ceil(48),
        }
    }

    /// Layout the wire format corresponds to on the GPU side.
    pub fn texture_layout(self) -> PixelLayout {
        match self {
            DataFormat::Rgba8 | DataFormat::Uyvy8 => PixelLayout::Rgba8,
            DataFormat::Bgra8 => PixelLayout::Bgra8,
            DataFormat::Yuv422_10 => PixelLayout::Rgb10A2Rev,
            DataFormat::Rgb10 => PixelLayout::Rgb10A2,
        }
    }

    /// CPU pass that turns a readback of `readback_layout()` into wire bytes.
    pub fn conversion(self) -> Conversion {
        match self {
            DataFormat::Rgba8 | DataFormat::Bgra8 => Conversion::Copy,
            DataFormat::Uyvy8 => Conversion::Uyvy8,
            DataFormat::Yuv422_10 => Conversion::V210,
            DataFormat::Rgb10 => Conversion::ReorderRgb10,
        }
    }

    /// Layout actually requested from the GPU.
    ///
    /// `10_10_10_2` is not GPU native and readback of it takes a slow driver path, so the
    /// reversed variant is read instead and reordered on the CPU.
    pub fn readback_layout(self) -> PixelLayout {
        match self.texture_layout() {
            PixelLayout::Rgb10A2 => PixelLayout::Rgb10A2Rev,
            other => other,
        }
    }

    pub fn is_ten_bit(self) -> bool {
        matches!(self, DataFormat::Yuv422_10 | DataFormat::Rgb10)
    }
}

/// Wire four-character codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FourCc {
    Rgba,
    Bgra,
    Uyvy,
    V210,
    R10b,
}

impl FourCc {
    pub fn code(self) -> [u8; 4] {
        match self {
            FourCc::Rgba => *b"RGBA",
            FourCc::Bgra => *b"BGRA",
            FourCc::Uyvy => *b"UYVY",
            FourCc::V210 => *b"v210",
            FourCc::R10b => *b"R10b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFormatDescriptor {
    pub format: DataFormat,
    pub fourcc: FourCc,
    pub is_rgb: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFormatDescriptor {
    pub width: usize,
    pub height: usize,
    pub pixel_aspect: f32,
    pub hertz: f64,
    pub rate_n: u32,
    pub rate_d: u32,
    pub description: &'static str,
}

impl VideoFormatDescriptor {
    /// Seconds per frame, from the exact rational rate.
    pub fn frame_duration(&self) -> f64 {
        self.rate_d as f64 / self.rate_n as f64
    }

    /// Whether `format` may be emitted at this resolution.
    ///
    /// 10-bit formats are limited to formats of at most 1080 lines.
    pub fn supports(&self, format: DataFormat) -> bool {
        !format.is_ten_bit() || self.height <= 1080
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Int16,
    Int32,
    Float32,
}

impl SampleFormat {
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Stereo2,
    Surround71,
    Sdds71,
    Generic16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormatDescriptor {
    pub sample_rate: u32,
    pub precision: SampleFormat,
    pub channels: usize,
    pub layout: ChannelLayout,
    pub description: &'static str,
}

impl AudioFormatDescriptor {
    /// Bytes of one interleaved sample frame (all channels).
    pub fn frame_bytes(&self) -> usize {
        self.channels * self.precision.bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMode {
    pub value: usize,
    pub description: &'static str,
}

const fn video(
    width: usize,
    height: usize,
    hertz: f64,
    rate_n: u32,
    rate_d: u32,
    description: &'static str,
) -> VideoFormatDescriptor {
    VideoFormatDescriptor { width, height, pixel_aspect: 1.0, hertz, rate_n, rate_d, description }
}

pub static VIDEO_FORMATS: &[VideoFormatDescriptor] = &[
    video(1280, 720, 23.98, 24000, 1001, "720p 23.98Hz"),
    video(1280, 720, 24.00, 24000, 1000, "720p 24Hz"),
    video(1280, 720, 29.97, 30000, 1001, "720p 29.97Hz"),
    video(1280, 720, 30.00, 30000, 1000, "720p 30Hz"),
    video(1280, 720, 50.00, 50000, 1000, "720p 50Hz"),
    video(1280, 720, 59.94, 60000, 1001, "720p 59.94Hz"),
    video(1280, 720, 60.00, 60000, 1000, "720p 60Hz"),
    video(1920, 1080, 23.98, 24000, 1001, "1080p 23.98Hz"),
    video(1920, 1080, 24.00, 24000, 1000, "1080p 24Hz"),
    video(1920, 1080, 25.00, 25000, 1000, "1080p 25Hz"),
    video(1920, 1080, 29.97, 30000, 1001, "1080p 29.97Hz"),
    video(1920, 1080, 30.00, 30000, 1000, "1080p 30Hz"),
    video(1920, 1080, 50.00, 50000, 1000, "1080p 50Hz"),
    video(1920, 1080, 59.94, 60000, 1001, "1080p 59.94Hz"),
    video(1920, 1080, 60.00, 60000, 1000, "1080p 60Hz"),
    video(2048, 1080, 23.98, 24000, 1001, "1080p (2048x1080) DCI 2K 23.98Hz"),
    video(2048, 1080, 24.00, 24000, 1000, "1080p (2048x1080) DCI 2K 24Hz"),
    video(2048, 1080, 25.00, 25000, 1000, "1080p (2048x1080) DCI 2K 25Hz"),
    video(2048, 1080, 29.97, 30000, 1001, "1080p (2048x1080) DCI 2K 29.97Hz"),
    video(2048, 1080, 30.00, 30000, 1000, "1080p (2048x1080) DCI 2K 30Hz"),
    video(2048, 1080, 50.00, 50000, 1000, "1080p (2048x1080) DCI 2K 50Hz"),
    video(2048, 1080, 59.94, 60000, 1001, "1080p (2048x1080) DCI 2K 59.94Hz"),
    video(2048, 1080, 60.00, 60000, 1000, "1080p (2048x1080) DCI 2K 60Hz"),
    video(3840, 2160, 23.98, 24000, 1001, "2160p (3840x2160) UHD 4K 23.98Hz"),
    video(3840, 2160, 24.00, 24000, 1000, "2160p (3840x2160) UHD 4K 24Hz"),
    video(3840, 2160, 25.00, 25000, 1000, "2160p (3840x2160) UHD 4K 25Hz"),
    video(3840, 2160, 29.97, 30000, 1001, "2160p (3840x2160) UHD 4K 29.97Hz"),
    video(3840, 2160, 30.00, 30000, 1000, "2160p (3840x2160) UHD 4K 30Hz"),
    video(3840, 2160, 50.00, 50000, 1000, "2160p (3840x2160) UHD 4K 50Hz"),
    video(3840, 2160, 59.94, 60000, 1001, "2160p (3840x2160) UHD 4K 59.94Hz"),
    video(3840, 2160, 60.00, 60000, 1000, "2160p (3840x2160) UHD 4K 60Hz"),
    video(4096, 2160, 23.98, 24000, 1001, "2160p (4096x2160) DCI 4K 23.98Hz"),
    video(4096, 2160, 24.00, 24000, 1000, "2160p (4096x2160) DCI 4K 24Hz"),
    video(4096, 2160, 25.00, 25000, 1000, "2160p (4096x2160) DCI 4K 25Hz"),
    video(4096, 2160, 29.97, 30000, 1001, "2160p (4096x2160) DCI 4K 29.97Hz"),
    video(4096, 2160, 30.00, 30000, 1000, "2160p (4096x2160) DCI 4K 30Hz"),
    video(4096, 2160, 50.00, 50000, 1000, "2160p (4096x2160) DCI 4K 50Hz"),
    video(4096, 2160, 59.94, 60000, 1001, "2160p (4096x2160) DCI 4K 59.94Hz"),
    video(4096, 2160, 60.00, 60000, 1000, "2160p (4096x2160) DCI 4K 60Hz"),
];

pub static DATA_FORMATS: &[DataFormatDescriptor] = &[
    DataFormatDescriptor { format: DataFormat::Rgba8, fourcc: FourCc::Rgba, is_rgb: true, description: "8-bit RGBA" },
    DataFormatDescriptor { format: DataFormat::Bgra8, fourcc: FourCc::Bgra, is_rgb: true, description: "8-bit BGRA" },
    DataFormatDescriptor { format: DataFormat::Uyvy8, fourcc: FourCc::Uyvy, is_rgb: false, description: "8-bit UYVY" },
    DataFormatDescriptor { format: DataFormat::Yuv422_10, fourcc: FourCc::V210, is_rgb: false, description: "10-bit YUV 4:2:2 (v210)" },
    DataFormatDescriptor { format: DataFormat::Rgb10, fourcc: FourCc::R10b, is_rgb: true, description: "10-bit RGB" },
];

pub static AUDIO_FORMATS: &[AudioFormatDescriptor] = &[
    AudioFormatDescriptor { sample_rate: 48000, precision: SampleFormat::Int16, channels: 2, layout: ChannelLayout::Stereo2, description: "16-bit 48kHz Stereo" },
    AudioFormatDescriptor { sample_rate: 48000, precision: SampleFormat::Int32, channels: 2, layout: ChannelLayout::Stereo2, description: "32-bit 48kHz Stereo" },
    AudioFormatDescriptor { sample_rate: 48000, precision: SampleFormat::Float32, channels: 8, layout: ChannelLayout::Surround71, description: "32-bit Float 48kHz 7.1 Surround" },
    AudioFormatDescriptor { sample_rate: 48000, precision: SampleFormat::Int32, channels: 8, layout: ChannelLayout::Sdds71, description: "32-bit 48kHz 7.1 Surround SDDS" },
    AudioFormatDescriptor { sample_rate: 48000, precision: SampleFormat::Int32, channels: 16, layout: ChannelLayout::Generic16, description: "32-bit 48kHz 16 channel" },
];

/// No external genlock: the only mode is free running.
pub static SYNC_MODES: &[SyncMode] = &[SyncMode { value: 0, description: "Free Running" }];

/// Data formats the catalog offers for `video`, in catalog order.
pub fn data_formats_for(video: &VideoFormatDescriptor) -> Vec<DataFormatDescriptor> {
    DATA_FORMATS.iter().filter(|d| video.supports(d.format)).copied().collect()
}

fn clamp_index(index: usize, count: usize) -> usize {
    index.min(count.saturating_sub(1))
}

/// Current video/data/audio/sync selection of one device.
#[derive(Debug, Clone)]
pub struct FormatCatalog {
    video: usize,
    data: usize,
    audio: usize,
    sync: usize,
    data_formats: Vec<DataFormatDescriptor>,
    cadence: AudioCadence,
    audio_frame_sizes: OnceCell<[usize; AUDIO_CADENCE_LEN]>,
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatCatalog {
    pub fn new() -> Self {
        Self {
            video: 0,
            data: 0,
            audio: 0,
            sync: 0,
            data_formats: data_formats_for(&VIDEO_FORMATS[0]),
            cadence: AudioCadence::default(),
            audio_frame_sizes: OnceCell::new(),
        }
    }

    // --- video ---

    pub fn num_video_formats(&self) -> usize {
        VIDEO_FORMATS.len()
    }

    pub fn video_format_at_index(&self, index: usize) -> &'static VideoFormatDescriptor {
        &VIDEO_FORMATS[clamp_index(index, VIDEO_FORMATS.len())]
    }

    /// Select a video format.
    ///
    /// Rebuilds the data-format list for the new format, resets the data-format
    /// selection to 0 and drops the cached audio frame-size sequence.
    pub fn set_video_format(&mut self, index: usize) {
        self.video = clamp_index(index, VIDEO_FORMATS.len());
        self.data_formats = data_formats_for(&VIDEO_FORMATS[self.video]);
        self.data = 0;
        self.audio_frame_sizes.take();
    }

    pub fn current_video_format(&self) -> usize {
        self.video
    }

    pub fn video_format(&self) -> &'static VideoFormatDescriptor {
        &VIDEO_FORMATS[self.video]
    }

    // --- data (pixel) formats ---

    pub fn num_data_formats(&self) -> usize {
        self.data_formats.len()
    }

    pub fn data_format_at_index(&self, index: usize) -> &DataFormatDescriptor {
        &self.data_formats[clamp_index(index, self.data_formats.len())]
    }

    pub fn set_data_format(&mut self, index: usize) {
        self.data = clamp_index(index, self.data_formats.len());
    }

    pub fn current_data_format(&self) -> usize {
        self.data
    }

    pub fn data_format(&self) -> &DataFormatDescriptor {
        &self.data_formats[self.data]
    }

    // --- audio ---

    pub fn num_audio_formats(&self) -> usize {
        AUDIO_FORMATS.len()
    }

    pub fn audio_format_at_index(&self, index: usize) -> &'static AudioFormatDescriptor {
        &AUDIO_FORMATS[clamp_index(index, AUDIO_FORMATS.len())]
    }

    pub fn set_audio_format(&mut self, index: usize) {
        self.audio = clamp_index(index, AUDIO_FORMATS.len());
        self.audio_frame_sizes.take();
    }

    pub fn current_audio_format(&self) -> usize {
        self.audio
    }

    pub fn audio_format(&self) -> &'static AudioFormatDescriptor {
        &AUDIO_FORMATS[self.audio]
    }

    // --- sync ---

    pub fn num_sync_modes(&self) -> usize {
        SYNC_MODES.len()
    }

    pub fn sync_mode_at_index(&self, index: usize) -> &'static SyncMode {
        &SYNC_MODES[clamp_index(index, SYNC_MODES.len())]
    }

    pub fn set_sync_mode(&mut self, index: usize) {
        self.sync = clamp_index(index, SYNC_MODES.len());
    }

    pub fn current_sync_mode(&self) -> usize {
        self.sync
    }

    // --- audio pacing ---

    pub fn audio_cadence(&self) -> AudioCadence {
        self.cadence
    }

    pub fn set_audio_cadence(&mut self, cadence: AudioCadence) {
        if self.cadence != cadence {
            self.cadence = cadence;
            self.audio_frame_sizes.take();
        }
    }

    /// Per-frame sample counts, repeating every five frames, for the current selection.
    ///
    /// Computed lazily and cached until the video format, audio format or cadence changes.
    pub fn audio_frame_size_sequence(&self) -> [usize; AUDIO_CADENCE_LEN] {
        *self.audio_frame_sizes.get_or_init(|| {
            audio::frame_size_sequence(
                self.audio_format().sample_rate,
                self.video_format(),
                self.cadence,
            )
        })
    }

    pub(crate) fn has_cached_audio_frame_sizes(&self) -> bool {
        self.audio_frame_sizes.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rational_matches_its_label() {
        for v in VIDEO_FORMATS {
            let hz = v.rate_n as f64 / v.rate_d as f64;
            assert!((hz - v.hertz).abs() < 0.01, "{}: {hz} vs {}", v.description, v.hertz);
        }
    }

    #[test]
    fn set_video_format_rebuilds_data_formats_and_resets_selection() {
        let mut cat = FormatCatalog::new();
        for i in 0..cat.num_video_formats() {
            cat.set_data_format(usize::MAX);
            cat.set_video_format(i);
            assert_eq!(cat.current_data_format(), 0);
            let video = cat.video_format_at_index(i);
            for d in 0..cat.num_data_formats() {
                assert!(video.supports(cat.data_format_at_index(d).format));
            }
            assert_eq!(cat.num_data_formats(), data_formats_for(video).len());
        }
    }

    #[test]
    fn uhd_excludes_ten_bit_formats() {
        let mut cat = FormatCatalog::new();
        let uhd = VIDEO_FORMATS.iter().position(|v| v.height == 2160).unwrap();
        cat.set_video_format(uhd);
        assert_eq!(cat.num_data_formats(), 3);
        assert!((0..cat.num_data_formats()).all(|i| !cat.data_format_at_index(i).format.is_ten_bit()));

        cat.set_video_format(0);
        assert_eq!(cat.num_data_formats(), DATA_FORMATS.len());
    }

    #[test]
    fn out_of_range_indices_clamp_to_last_entry() {
        let mut cat = FormatCatalog::new();
        let last_video = cat.num_video_formats() - 1;
        assert_eq!(cat.video_format_at_index(1000), &VIDEO_FORMATS[last_video]);
        cat.set_video_format(1000);
        assert_eq!(cat.current_video_format(), last_video);

        cat.set_data_format(99);
        assert_eq!(cat.current_data_format(), cat.num_data_formats() - 1);
        assert_eq!(cat.data_format_at_index(99), cat.data_format());

        cat.set_audio_format(AUDIO_FORMATS.len());
        assert_eq!(cat.current_audio_format(), AUDIO_FORMATS.len() - 1);
        assert_eq!(cat.audio_format_at_index(42).description, "32-bit 48kHz 16 channel");

        cat.set_sync_mode(7);
        assert_eq!(cat.current_sync_mode(), 0);
        assert_eq!(cat.sync_mode_at_index(7).description, "Free Running");
    }

    #[test]
    fn format_changes_clear_audio_frame_size_cache() {
        let mut cat = FormatCatalog::new();
        let _ = cat.audio_frame_size_sequence();
        assert!(cat.has_cached_audio_frame_sizes());

        cat.set_video_format(10);
        assert!(!cat.has_cached_audio_frame_sizes());
        assert_eq!(cat.audio_frame_size_sequence(), [1602, 1601, 1602, 1601, 1602]);

        cat.set_audio_format(1);
        assert!(!cat.has_cached_audio_frame_sizes());
    }

    #[test]
    fn strides_follow_each_format() {
        assert_eq!(DataFormat::Rgba8.bytes_per_line(1920), 7680);
        assert_eq!(DataFormat::Uyvy8.bytes_per_line(1920), 3840);
        assert_eq!(DataFormat::Yuv422_10.bytes_per_line(1920), 5120);
        assert_eq!(DataFormat::Yuv422_10.bytes_per_line(1280), 128 * 27);
        assert_eq!(DataFormat::Rgb10.bytes_per_line(10), 40);
    }

    #[test]
    fn ten_bit_rgb_reads_back_reversed() {
        assert_eq!(DataFormat::Rgb10.texture_layout(), PixelLayout::Rgb10A2);
        assert_eq!(DataFormat::Rgb10.readback_layout(), PixelLayout::Rgb10A2Rev);
        assert_eq!(DataFormat::Bgra8.readback_layout(), PixelLayout::Bgra8);
    }
}
