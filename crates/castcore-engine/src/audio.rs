//! Audio pacing and the audio double buffer.
//!
//! The producer (often not the render thread) writes one video frame's worth of interleaved
//! samples into the slot at `index`, then flips `index`. The render thread transmits the
//! other slot. One mutex guards the flag, the index and both slots.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;

use crate::formats::{AudioFormatDescriptor, VideoFormatDescriptor};

/// Length of the repeating per-frame sample-count sequence.
pub const AUDIO_CADENCE_LEN: usize = 5;

/// How fractional samples-per-frame are rounded into whole per-frame counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioCadence {
    /// Every frame carries `round(samples per frame)`.
    Rounded,
    /// Counts alternate so five frames carry `round(5 * samples per frame)` in total.
    #[default]
    Distributed,
}

pub fn samples_per_frame(sample_rate: u32, video: &VideoFormatDescriptor) -> f64 {
    sample_rate as f64 * video.frame_duration()
}

pub fn frame_size_sequence(
    sample_rate: u32,
    video: &VideoFormatDescriptor,
    cadence: AudioCadence,
) -> [usize; AUDIO_CADENCE_LEN] {
    let spf = samples_per_frame(sample_rate, video);
    let mut out = [0usize; AUDIO_CADENCE_LEN];
    match cadence {
        AudioCadence::Rounded => out.fill((spf + 0.5) as usize),
        AudioCadence::Distributed => {
            for (k, entry) in out.iter_mut().enumerate() {
                let end = ((k + 1) as f64 * spf).round() as usize;
                let start = (k as f64 * spf).round() as usize;
                *entry = end - start;
            }
        }
    }
    out
}

/// Sizes of one audio slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioGeometry {
    pub channels: usize,
    pub bytes_per_sample: usize,
    /// Largest per-frame sample count the slot must hold.
    pub max_samples: usize,
}

impl AudioGeometry {
    pub fn new(format: &AudioFormatDescriptor, sizes: &[usize; AUDIO_CADENCE_LEN]) -> Self {
        Self {
            channels: format.channels,
            bytes_per_sample: format.precision.bytes(),
            max_samples: sizes.iter().copied().max().unwrap_or(0),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels * self.bytes_per_sample
    }

    pub fn slot_bytes(&self) -> usize {
        self.max_samples * self.frame_bytes()
    }
}

#[derive(Debug)]
struct AudioSlots {
    has_audio: bool,
    index: usize,
    slots: [Vec<u8>; 2],
    samples: [usize; 2],
}

#[derive(Debug)]
pub struct AudioDoubleBuffer {
    geometry: AudioGeometry,
    inner: Mutex<AudioSlots>,
}

impl AudioDoubleBuffer {
    pub fn new(geometry: AudioGeometry) -> Self {
        let bytes = geometry.slot_bytes();
        Self {
            geometry,
            inner: Mutex::new(AudioSlots {
                has_audio: false,
                index: 0,
                slots: [vec![0u8; bytes], vec![0u8; bytes]],
                samples: [0, 0],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AudioSlots> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn geometry(&self) -> AudioGeometry {
        self.geometry
    }

    /// Store `samples` interleaved sample frames from `data` and flip the active slot.
    ///
    /// `None` means "no audio this frame": the flag is cleared and nothing is copied.
    /// Input longer than a slot is truncated.
    pub fn write(&self, data: Option<&[u8]>, samples: usize) {
        let mut g = self.lock();
        let Some(data) = data else {
            g.has_audio = false;
            return;
        };

        let frame_bytes = self.geometry.frame_bytes().max(1);
        let bytes = (samples * frame_bytes).min(data.len()).min(self.geometry.slot_bytes());
        let i = g.index;
        g.slots[i][..bytes].copy_from_slice(&data[..bytes]);
        g.samples[i] = bytes / frame_bytes;
        g.index = 1 - i;
        g.has_audio = true;
    }

    pub fn has_audio(&self) -> bool {
        self.lock().has_audio
    }

    /// Slot the producer writes next.
    pub fn active_index(&self) -> usize {
        self.lock().index
    }

    /// Run `f` over the most recently written slot and its sample count.
    ///
    /// Returns `None` without calling `f` while no audio is flagged.
    pub fn with_latest<R>(&self, f: impl FnOnce(&[u8], usize) -> R) -> Option<R> {
        let g = self.lock();
        if !g.has_audio {
            return None;
        }
        let i = 1 - g.index;
        let len = g.samples[i] * self.geometry.frame_bytes();
        Some(f(&g.slots[i][..len], g.samples[i]))
    }

    pub fn slot_bytes(&self, slot: usize) -> Vec<u8> {
        self.lock().slots[slot & 1].clone()
    }
}

/// Cloneable handle for an audio producer thread.
///
/// Stays tied to the buffers of the session that handed it out; a new one is needed after
/// the session is closed and reopened.
#[derive(Debug, Clone)]
pub struct AudioSink {
    buffer: Arc<AudioDoubleBuffer>,
}

impl AudioSink {
    pub(crate) fn new(buffer: Arc<AudioDoubleBuffer>) -> Self {
        Self { buffer }
    }

    pub fn transfer_audio(&self, data: Option<&[u8]>, samples: usize) {
        self.buffer.write(data, samples);
    }

    pub fn geometry(&self) -> AudioGeometry {
        self.buffer.geometry()
    }
}
