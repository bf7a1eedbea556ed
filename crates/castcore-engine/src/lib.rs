//! castcore engine: GPU frame capture and network video output.
//!
//! A renderer opens a [`Device`], binds it to its GL context and calls [`Device::transfer`]
//! once per rendered frame. The device reads the framebuffer back through a ring of pack
//! buffers, converts it to the selected wire format and hands it to a [`Transport`].

pub mod logging;

pub mod audio;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod events;
pub mod formats;
pub mod gpu;
pub mod ring;
pub mod transport;
pub mod validate;

pub use audio::{AudioCadence, AudioSink};
pub use config::{DeviceOptions, TransferMethod};
pub use device::{Device, Timing};
pub use error::DeviceError;
pub use events::{DeviceEvent, SkipReason};
pub use formats::{FormatCatalog, FourCc};
pub use gpu::{FramebufferId, GlowGpu, HeadlessGpu, ReadbackGpu};
pub use transport::{Transport, TransportFactory, TransportStats};
