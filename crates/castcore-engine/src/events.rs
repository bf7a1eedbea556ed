use crate::formats::FourCc;

/// Why a channel produced nothing this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No transfer buffers are bound.
    RingEmpty,
    /// Map or read of the frame failed.
    Readback,
    /// The session is not open.
    NotOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Session opened with this geometry.
    Opened { width: usize, height: usize, fourcc: FourCc, ring_size: usize, stereo: bool },

    Closed,

    /// The transport could not be created; the session stays open but sends nothing.
    TransportUnavailable { error: String },

    /// A frame was handed to the transport (or would have been, in degraded mode).
    FrameSubmitted { channel: usize, slot: usize, tick: u64, audio_samples: usize },

    FrameSkipped { channel: usize, reason: SkipReason },
}
