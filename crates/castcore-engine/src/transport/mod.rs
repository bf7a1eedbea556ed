//! Outbound transport
//!
//! The session hands each finished frame (and the latest audio snapshot) to a `Transport`.
//! Transports are created through a `TransportFactory` when the session opens, so the same
//! session code drives the NDI sender, the null sink of headless runs and test recorders.

pub mod ndi;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::formats::{FourCc, SampleFormat};

/// One video frame, rows top-down unless the session was opened with vflip off.
#[derive(Debug, Clone, Copy)]
pub struct VideoSubmission<'a> {
    pub channel: usize,
    pub width: usize,
    pub height: usize,
    pub fourcc: FourCc,
    pub line_stride: usize,
    pub rate_n: u32,
    pub rate_d: u32,
    pub aspect: f32,
    pub data: &'a [u8],
}

/// Interleaved audio for one frame.
#[derive(Debug, Clone, Copy)]
pub struct AudioSubmission<'a> {
    pub sample_rate: u32,
    pub channels: usize,
    pub samples: usize,
    pub precision: SampleFormat,
    pub data: &'a [u8],
}

/// What a transport needs to know when it is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderConfig {
    pub name: String,
    pub groups: Option<String>,
    pub clock_video: bool,
    pub width: usize,
    pub height: usize,
    pub rate_n: u32,
    pub rate_d: u32,
}

pub trait Transport: Send {
    fn send_video(&mut self, frame: &VideoSubmission<'_>) -> anyhow::Result<()>;
    fn send_audio(&mut self, audio: &AudioSubmission<'_>) -> anyhow::Result<()>;
}

pub type TransportFactory = Box<dyn Fn(&SenderConfig) -> anyhow::Result<Box<dyn Transport>> + Send>;

/// Submission counters shared with whoever created a `NullTransport`.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub audio_samples: AtomicU64,
}

impl TransportStats {
    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn audio_samples(&self) -> u64 {
        self.audio_samples.load(Ordering::Relaxed)
    }
}

/// Accepts everything and only counts it.
#[derive(Debug, Default)]
pub struct NullTransport {
    stats: Arc<TransportStats>,
}

impl NullTransport {
    pub fn new(stats: Arc<TransportStats>) -> Self {
        Self { stats }
    }
}

impl Transport for NullTransport {
    fn send_video(&mut self, _frame: &VideoSubmission<'_>) -> anyhow::Result<()> {
        self.stats.video_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_audio(&mut self, audio: &AudioSubmission<'_>) -> anyhow::Result<()> {
        self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.stats.audio_samples.fetch_add(audio.samples as u64, Ordering::Relaxed);
        Ok(())
    }
}

pub fn null_factory(stats: Arc<TransportStats>) -> TransportFactory {
    Box::new(move |_cfg: &SenderConfig| -> anyhow::Result<Box<dyn Transport>> {
        Ok(Box::new(NullTransport::new(stats.clone())))
    })
}

/// NDI sender. Fails at open when the crate is built without the `ndi` feature.
pub fn ndi_factory() -> TransportFactory {
    Box::new(|cfg: &SenderConfig| -> anyhow::Result<Box<dyn Transport>> {
        Ok(Box::new(ndi::NdiTransport::new(cfg)?))
    })
}
