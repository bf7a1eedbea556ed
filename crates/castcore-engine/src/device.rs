//! Device session
//!
//! `Device` is what a renderer drives: it owns the format selection, the transfer ring, the
//! frame slots, the audio double buffer and the transport. Lifecycle:
//!
//!   open(args) -> bind() -> transfer(fbo)... -> unbind() -> close()
//!
//! `bind`, `transfer*` and `unbind` belong to the render thread and must not overlap.
//! `transfer_audio` (or an `AudioSink`) may be called from any thread.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::audio::{AudioDoubleBuffer, AudioGeometry, AudioSink, AUDIO_CADENCE_LEN};
use crate::config::{self, DeviceOptions, TransferMethod};
use crate::convert::{self, ConversionPlan};
use crate::events::{DeviceEvent, SkipReason};
use crate::formats::{
    AudioFormatDescriptor, DataFormatDescriptor, FormatCatalog, SyncMode, VideoFormatDescriptor,
};
use crate::gpu::{FramebufferId, ReadbackGpu};
use crate::ring::{FrameQueue, FrameSlot, PboEntry, PboRing, PboStatus, TransferOutcome};
use crate::transport::{AudioSubmission, SenderConfig, Transport, TransportFactory, VideoSubmission};
use crate::validate;
use crate::{loge, logi, logw};

/// Output frame rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub rate_n: u32,
    pub rate_d: u32,
    pub hertz: f64,
}

impl Timing {
    pub fn frame_duration(&self) -> f64 {
        self.rate_d as f64 / self.rate_n.max(1) as f64
    }
}

/// Everything that exists only between `open` and `close`.
struct Session {
    video: &'static VideoFormatDescriptor,
    data: DataFormatDescriptor,
    audio_format: &'static AudioFormatDescriptor,
    plan: ConversionPlan,
    eyes: usize,
    frames: FrameQueue,
    readback: FrameQueue,
    audio: Arc<AudioDoubleBuffer>,
    // None: degraded mode, submissions are dropped.
    transport: Option<Box<dyn Transport>>,
    // Top-down copy handed to the transport when vflip is on.
    submit: Vec<u8>,
}

pub struct Device<G: ReadbackGpu> {
    name: String,
    gpu: G,
    factory: TransportFactory,
    catalog: FormatCatalog,
    options: DeviceOptions,
    session: Option<Session>,
    ring: PboRing,
    tick: u64,
    events: Option<Sender<DeviceEvent>>,
}

impl<G: ReadbackGpu> Device<G> {
    pub fn new(name: impl Into<String>, gpu: G, factory: TransportFactory) -> Self {
        Self {
            name: name.into(),
            gpu,
            factory,
            catalog: FormatCatalog::new(),
            options: DeviceOptions::default(),
            session: None,
            ring: PboRing::default(),
            tick: 0,
            events: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    /// Receive `DeviceEvent`s. Delivery never blocks; events are dropped when the channel is full.
    pub fn set_event_sink(&mut self, tx: Sender<DeviceEvent>) {
        self.events = Some(tx);
    }

    fn emit(&self, ev: DeviceEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(ev);
        }
    }

    // --- format catalog ---

    pub fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    pub fn num_video_formats(&self) -> usize {
        self.catalog.num_video_formats()
    }

    pub fn video_format_at_index(&self, index: usize) -> &'static VideoFormatDescriptor {
        self.catalog.video_format_at_index(index)
    }

    /// Takes effect at the next `open`. Resets the data format to index 0.
    pub fn set_video_format(&mut self, index: usize) {
        self.catalog.set_video_format(index);
    }

    pub fn current_video_format(&self) -> usize {
        self.catalog.current_video_format()
    }

    pub fn num_data_formats(&self) -> usize {
        self.catalog.num_data_formats()
    }

    pub fn data_format_at_index(&self, index: usize) -> DataFormatDescriptor {
        *self.catalog.data_format_at_index(index)
    }

    pub fn set_data_format(&mut self, index: usize) {
        self.catalog.set_data_format(index);
    }

    pub fn current_data_format(&self) -> usize {
        self.catalog.current_data_format()
    }

    pub fn num_audio_formats(&self) -> usize {
        self.catalog.num_audio_formats()
    }

    pub fn audio_format_at_index(&self, index: usize) -> &'static AudioFormatDescriptor {
        self.catalog.audio_format_at_index(index)
    }

    pub fn set_audio_format(&mut self, index: usize) {
        self.catalog.set_audio_format(index);
    }

    pub fn current_audio_format(&self) -> usize {
        self.catalog.current_audio_format()
    }

    pub fn num_sync_modes(&self) -> usize {
        self.catalog.num_sync_modes()
    }

    pub fn sync_mode_at_index(&self, index: usize) -> &'static SyncMode {
        self.catalog.sync_mode_at_index(index)
    }

    pub fn set_sync_mode(&mut self, index: usize) {
        self.catalog.set_sync_mode(index);
    }

    pub fn current_sync_mode(&self) -> usize {
        self.catalog.current_sync_mode()
    }

    /// Per-frame audio sample counts, repeating every five frames.
    pub fn audio_frame_size_sequence(&self) -> [usize; AUDIO_CADENCE_LEN] {
        self.catalog.audio_frame_size_sequence()
    }

    // --- lifecycle ---

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    /// Open with `args` (see `config::usage`). Does nothing when already open.
    ///
    /// Option problems are logged and fall back to defaults. A transport that cannot be
    /// created leaves the session open in degraded mode: transfers run, nothing is sent.
    pub fn open(&mut self, args: &[String]) {
        if self.is_open() {
            return;
        }

        let (options, issues) = config::resolve_options(args);
        validate::emit_issues("CONFIG", &issues);
        validate::emit_summary("CONFIG", "device options", &issues);
        if options.help {
            logi!("CONFIG", "device options:\n{}", config::usage());
        }
        self.options = options;
        self.catalog.set_audio_cadence(self.options.audio_cadence);

        let video = self.catalog.video_format();
        let data = *self.catalog.data_format();
        let audio_format = self.catalog.audio_format();
        let plan = ConversionPlan::new(data.format, video.width, video.height);
        let eyes = if self.options.stereo { 2 } else { 1 };
        let slots = self.options.ring_buffer_size * eyes;

        let frames = FrameQueue::filled(slots, &plan.blank_frame());
        let readback = if plan.needs_conversion() {
            FrameQueue::allocate(slots, plan.readback_bytes())
        } else {
            FrameQueue::default()
        };
        let geometry = AudioGeometry::new(audio_format, &self.catalog.audio_frame_size_sequence());
        let audio = Arc::new(AudioDoubleBuffer::new(geometry));

        let sender = SenderConfig {
            name: self.options.sender_name.clone(),
            groups: self.options.groups.clone(),
            clock_video: self.options.clock_video,
            width: video.width,
            height: video.height,
            rate_n: video.rate_n,
            rate_d: video.rate_d,
        };
        let transport = match (self.factory)(&sender) {
            Ok(t) => Some(t),
            Err(e) => {
                loge!("OUTPUT", "transport unavailable, output disabled: {e:#}");
                self.emit(DeviceEvent::TransportUnavailable { error: format!("{e:#}") });
                None
            }
        };

        self.ring = PboRing::new(self.options.verbose);
        self.session = Some(Session {
            video,
            data,
            audio_format,
            plan,
            eyes,
            frames,
            readback,
            audio,
            transport,
            submit: vec![0; plan.output_bytes()],
        });

        logi!(
            "DEVICE",
            "open '{}': {} / {} / {} | method={} ring={} stereo={}",
            self.name,
            video.description,
            data.description,
            audio_format.description,
            self.options.method.name(),
            self.options.ring_buffer_size,
            self.options.stereo
        );
        self.emit(DeviceEvent::Opened {
            width: video.width,
            height: video.height,
            fourcc: data.fourcc,
            ring_size: self.options.ring_buffer_size,
            stereo: self.options.stereo,
        });
    }

    /// Release GPU buffers, frame slots, audio buffers and the transport. Safe to repeat.
    pub fn close(&mut self) {
        self.ring.unbind(&mut self.gpu);
        if self.session.take().is_some() {
            logi!("DEVICE", "closed '{}'", self.name);
            self.emit(DeviceEvent::Closed);
        }
    }

    pub fn width(&self) -> usize {
        self.session.as_ref().map(|s| s.video.width).unwrap_or(self.catalog.video_format().width)
    }

    pub fn height(&self) -> usize {
        self.session.as_ref().map(|s| s.video.height).unwrap_or(self.catalog.video_format().height)
    }

    /// Active video format (the selected one while closed).
    pub fn format(&self) -> &'static VideoFormatDescriptor {
        self.session.as_ref().map(|s| s.video).unwrap_or(self.catalog.video_format())
    }

    pub fn timing(&self) -> Timing {
        let v = self.format();
        Timing { rate_n: v.rate_n, rate_d: v.rate_d, hertz: v.hertz }
    }

    pub fn device_latency(&self) -> usize {
        0
    }

    pub fn async_max_mapped_buffers(&self) -> usize {
        self.options.ring_buffer_size
    }

    // --- GPU resources ---

    /// Allocate the transfer ring (ring size buffers per eye) and restart the clock.
    pub fn bind(&mut self) {
        let eyes = self.session.as_ref().map(|s| s.eyes).unwrap_or(1);
        self.bind_eyes(eyes);
    }

    /// Bind for two outputs (left and right) regardless of the stereo option.
    pub fn bind2(&mut self) {
        self.bind_eyes(2);
    }

    fn bind_eyes(&mut self, eyes: usize) {
        let Some(session) = self.session.as_ref() else {
            logw!("RING", "bind before open ignored");
            return;
        };
        self.tick = 0;
        if self.options.method == TransferMethod::DirectReadback {
            return;
        }
        let count = self.options.ring_buffer_size * eyes;
        let bytes = session.plan.readback_bytes();
        if let Err(e) = self.ring.bind(&mut self.gpu, count, bytes) {
            loge!("RING", "bound {} of {count} transfer buffers: {e}", self.ring.len());
        }
    }

    pub fn unbind(&mut self) {
        self.ring.unbind(&mut self.gpu);
    }

    /// Wait for all GPU work. Diagnostic only.
    pub fn finish(&mut self) {
        self.gpu.finish();
    }

    // --- transfers ---

    pub fn ready_for_transfer(&self) -> bool {
        true
    }

    /// Direct readback waits for the GPU inside `transfer`.
    pub fn will_block_on_transfer(&self) -> bool {
        self.options.method == TransferMethod::DirectReadback
    }

    /// One output frame from `fbo`. Advances the clock by one tick.
    pub fn transfer(&mut self, fbo: FramebufferId) {
        self.transfer_channel(0, fbo);
        self.advance_tick();
    }

    /// One stereo output frame. Advances the clock by one tick.
    ///
    /// Pipelined transfers submit `right` first: every channel converts the read queued by
    /// the call before it, so channel 0 receives the left eye queued at the end of the
    /// previous tick and channel 1 the right eye queued just before it.
    pub fn transfer2(&mut self, left: FramebufferId, right: FramebufferId) {
        match self.options.method {
            TransferMethod::Pipelined => {
                self.transfer_channel(0, right);
                self.transfer_channel(1, left);
            }
            TransferMethod::DirectReadback => {
                self.transfer_channel(0, left);
                self.transfer_channel(1, right);
            }
        }
        self.advance_tick();
    }

    fn advance_tick(&mut self) {
        if self.is_open() {
            self.tick += 1;
        }
    }

    /// Device clock: output frames transferred so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    fn transfer_channel(&mut self, channel: usize, fbo: FramebufferId) {
        let tick = self.tick;
        let Self { gpu, ring, session, options, .. } = self;
        let Some(session) = session.as_mut() else {
            self.emit(DeviceEvent::FrameSkipped { channel, reason: SkipReason::NotOpen });
            return;
        };

        gpu.begin_readback(fbo);
        let plan = session.plan;
        let Some(slot) = session.frames.rotate() else {
            gpu.end_readback(fbo);
            return;
        };
        let readback_slot = if plan.needs_conversion() { session.readback.rotate() } else { None };

        let produced = match options.method {
            TransferMethod::Pipelined => {
                if ring.is_empty() {
                    loge!("RING", "transfer without bound transfer buffers; frame skipped");
                    gpu.end_readback(fbo);
                    Err(SkipReason::RingEmpty)
                } else {
                    match ring.transfer(gpu, fbo, &plan, &mut slot.data) {
                        TransferOutcome::Converted | TransferOutcome::Primed => Ok(()),
                        TransferOutcome::Skipped => Err(SkipReason::Readback),
                    }
                }
            }
            TransferMethod::DirectReadback => {
                let res = read_direct(gpu, &plan, slot, readback_slot);
                gpu.end_readback(fbo);
                res
            }
        };

        let slot_id = slot.id;
        if produced.is_err() {
            // the previous frame stays the ready one
            session.frames.unrotate();
            if plan.needs_conversion() {
                session.readback.unrotate();
            }
        }
        let event = match produced {
            Ok(()) => {
                let audio_samples = submit(session, channel, slot_id, options.vflip);
                if options.verbose {
                    logi!("DEVICE", "tick {tick} channel {channel}: slot {slot_id} sent");
                }
                DeviceEvent::FrameSubmitted { channel, slot: slot_id, tick, audio_samples }
            }
            Err(reason) => DeviceEvent::FrameSkipped { channel, reason },
        };
        self.emit(event);
    }

    // --- audio ---

    /// Store one frame of interleaved audio for the next transfer. `None` means no audio this
    /// frame: nothing is sent until audio is written again.
    pub fn transfer_audio(&self, data: Option<&[u8]>, samples: usize) {
        match &self.session {
            Some(s) => s.audio.write(data, samples),
            None => logw!("AUDIO", "audio written to closed device '{}' ignored", self.name),
        }
    }

    /// Handle for an audio producer on another thread. `None` while closed.
    pub fn audio_sink(&self) -> Option<AudioSink> {
        self.session.as_ref().map(|s| AudioSink::new(s.audio.clone()))
    }

    // --- inspection ---

    pub fn pbo_states(&self) -> Vec<PboStatus> {
        self.ring.states()
    }

    /// Shared handles to the ring entries for status queries from other threads.
    pub fn pbo_entries(&self) -> Vec<Arc<PboEntry>> {
        self.ring.entries()
    }

    /// Output slot ids, front of the queue first.
    pub fn output_slot_ids(&self) -> Vec<usize> {
        self.session.as_ref().map(|s| s.frames.ids()).unwrap_or_default()
    }

    /// The slot most recently filled (bottom-up rows, wire format).
    pub fn ready_frame(&self) -> Option<&FrameSlot> {
        self.session.as_ref().and_then(|s| s.frames.back())
    }

    pub fn is_degraded(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.transport.is_none())
    }

    pub fn data_format(&self) -> Option<DataFormatDescriptor> {
        self.session.as_ref().map(|s| s.data)
    }
}

impl<G: ReadbackGpu> Drop for Device<G> {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_direct<G: ReadbackGpu>(
    gpu: &mut G,
    plan: &ConversionPlan,
    slot: &mut FrameSlot,
    readback_slot: Option<&mut FrameSlot>,
) -> Result<(), SkipReason> {
    let res = match readback_slot {
        Some(rb) => gpu
            .read_pixels(plan.width, plan.height, plan.readback, &mut rb.data)
            .map(|()| plan.apply(&rb.data, &mut slot.data)),
        None => gpu.read_pixels(plan.width, plan.height, plan.readback, &mut slot.data),
    };
    res.map_err(|e| {
        loge!("DEVICE", "{e}");
        SkipReason::Readback
    })
}

/// Hand the back slot (and, on channel 0, the latest audio) to the transport.
/// Returns the audio sample count sent.
fn submit(session: &mut Session, channel: usize, slot_id: usize, vflip: bool) -> usize {
    let Session { video, data, audio_format, plan, frames, audio, transport, submit, .. } = session;
    let Some(transport) = transport.as_mut() else {
        return 0;
    };
    let Some(slot) = frames.back() else {
        return 0;
    };
    debug_assert_eq!(slot.id, slot_id);

    let pixels: &[u8] = if vflip {
        convert::flip_rows(&slot.data, submit, plan.out_stride, plan.height);
        &submit[..]
    } else {
        &slot.data
    };
    let frame = VideoSubmission {
        channel,
        width: video.width,
        height: video.height,
        fourcc: data.fourcc,
        line_stride: plan.out_stride,
        rate_n: video.rate_n,
        rate_d: video.rate_d,
        aspect: video.pixel_aspect,
        data: pixels,
    };
    if let Err(e) = transport.send_video(&frame) {
        loge!("OUTPUT", "video send failed: {e:#}");
    }

    if channel != 0 {
        return 0;
    }
    audio
        .with_latest(|bytes, samples| {
            let submission = AudioSubmission {
                sample_rate: audio_format.sample_rate,
                channels: audio_format.channels,
                samples,
                precision: audio_format.precision,
                data: bytes,
            };
            if let Err(e) = transport.send_audio(&submission) {
                loge!("OUTPUT", "audio send failed: {e:#}");
            }
            samples
        })
        .unwrap_or(0)
}
