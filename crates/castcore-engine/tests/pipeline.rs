use std::sync::{Arc, Mutex};
use std::thread;

use castcore_engine::gpu::{GpuOp, HeadlessGpu, PixelLayout};
use castcore_engine::ring::PboState;
use castcore_engine::transport::{AudioSubmission, SenderConfig, Transport, TransportFactory, VideoSubmission};
use castcore_engine::{Device, DeviceEvent, FourCc, SkipReason};

#[derive(Debug, Clone)]
struct SentFrame {
    channel: usize,
    fourcc: FourCc,
    stride: usize,
    first: [u8; 4],
    last: [u8; 4],
}

#[derive(Debug, Default)]
struct Recording {
    configs: Vec<SenderConfig>,
    video: Vec<SentFrame>,
    audio: Vec<(usize, Vec<u8>)>,
}

struct Recorder(Arc<Mutex<Recording>>);

impl Transport for Recorder {
    fn send_video(&mut self, frame: &VideoSubmission<'_>) -> anyhow::Result<()> {
        let d = frame.data;
        let n = d.len();
        self.0.lock().unwrap().video.push(SentFrame {
            channel: frame.channel,
            fourcc: frame.fourcc,
            stride: frame.line_stride,
            first: [d[0], d[1], d[2], d[3]],
            last: [d[n - 4], d[n - 3], d[n - 2], d[n - 1]],
        });
        Ok(())
    }

    fn send_audio(&mut self, audio: &AudioSubmission<'_>) -> anyhow::Result<()> {
        self.0.lock().unwrap().audio.push((audio.samples, audio.data.to_vec()));
        Ok(())
    }
}

fn recorder() -> (TransportFactory, Arc<Mutex<Recording>>) {
    let rec = Arc::new(Mutex::new(Recording::default()));
    let shared = rec.clone();
    let factory: TransportFactory = Box::new(move |cfg: &SenderConfig| -> anyhow::Result<Box<dyn Transport>> {
        shared.lock().unwrap().configs.push(cfg.clone());
        Ok(Box::new(Recorder(shared.clone())))
    });
    (factory, rec)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn device() -> (Device<HeadlessGpu>, HeadlessGpu, Arc<Mutex<Recording>>) {
    let gpu = HeadlessGpu::new();
    let (factory, rec) = recorder();
    (Device::new("pipeline", gpu.clone(), factory), gpu, rec)
}

fn firsts(rec: &Arc<Mutex<Recording>>) -> Vec<(usize, u8)> {
    rec.lock().unwrap().video.iter().map(|f| (f.channel, f.first[0])).collect()
}

#[test]
fn pipelined_output_lags_one_frame() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--ring-buffer-size", "3"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);

    for i in 1..=4u8 {
        gpu.fill(fbo, [i, 0, 0, 255]);
        dev.transfer(fbo);
    }

    // First submission is the blank slot from priming.
    assert_eq!(firsts(&rec), vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    let first = rec.lock().unwrap().video[1].clone();
    assert_eq!(first.fourcc, FourCc::Rgba);
    assert_eq!(first.stride, 1280 * 4);
    assert_eq!(first.first, [1, 0, 0, 255]);
    assert_eq!(dev.tick(), 4);

    // The last read is still queued and holds the framebuffer.
    assert!(gpu.is_held(fbo));
    dev.unbind();
    assert!(!gpu.is_held(fbo));
    assert_eq!(gpu.live_buffers(), 0);
}

#[test]
fn direct_readback_sends_the_same_frame() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--method", "basic"]));
    assert!(dev.will_block_on_transfer());
    let fbo = gpu.create_framebuffer(1280, 720);

    for i in 1..=3u8 {
        gpu.fill(fbo, [i, 0, 0, 255]);
        dev.transfer(fbo);
        assert!(!gpu.is_held(fbo));
    }
    assert_eq!(firsts(&rec), vec![(0, 1), (0, 2), (0, 3)]);
    assert_eq!(gpu.live_buffers(), 0);
}

#[test]
fn pipelined_stereo_keeps_eyes_on_their_channels() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--stereo", "--ring-buffer-size", "2"]));
    dev.bind();
    assert_eq!(gpu.live_buffers(), 4);
    let left = gpu.create_framebuffer(1280, 720);
    let right = gpu.create_framebuffer(1280, 720);

    for t in 1..=3u8 {
        gpu.fill(left, [10 + t, 0, 0, 255]);
        gpu.fill(right, [20 + t, 0, 0, 255]);
        dev.transfer2(left, right);
    }

    // Channel 0 carries the previous tick's left eye, channel 1 the current right eye.
    assert_eq!(firsts(&rec), vec![(0, 0), (1, 21), (0, 11), (1, 22), (0, 12), (1, 23)]);
    assert_eq!(dev.tick(), 3);
}

#[test]
fn direct_stereo_sends_left_then_right() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--stereo", "--method", "basic"]));
    let left = gpu.create_framebuffer(1280, 720);
    let right = gpu.create_framebuffer(1280, 720);

    for t in 1..=2u8 {
        gpu.fill(left, [10 + t, 0, 0, 255]);
        gpu.fill(right, [20 + t, 0, 0, 255]);
        dev.transfer2(left, right);
    }
    assert_eq!(firsts(&rec), vec![(0, 11), (1, 21), (0, 12), (1, 22)]);
}

#[test]
fn ring_keeps_one_read_in_flight() {
    let (mut dev, gpu, _rec) = device();
    dev.open(&args(&["--ring-buffer-size", "3"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    for _ in 0..5 {
        dev.transfer(fbo);
    }

    let states = dev.pbo_states();
    assert_eq!(states.len(), 3);
    let in_flight: Vec<_> = states.iter().filter(|s| s.state == PboState::Transferring).collect();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].fbo, Some(fbo));
    assert!(states.iter().filter(|s| s.state != PboState::Transferring).all(|s| s.state == PboState::Ready && s.fbo.is_none()));

    assert_eq!(dev.output_slot_ids(), vec![2, 0, 1]);
    assert_eq!(dev.ready_frame().map(|s| s.id), Some(1));
    assert_eq!(gpu.mapped_buffers(), 0);
}

#[test]
fn failed_unmap_is_retried_before_reuse() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--ring-buffer-size", "2"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    gpu.fill(fbo, [9, 9, 9, 255]);

    dev.transfer(fbo);
    gpu.set_fail_unmap(true);
    dev.transfer(fbo);
    let states: Vec<_> = dev.pbo_states().iter().map(|s| s.state).collect();
    assert_eq!(states, vec![PboState::NeedsUnmap, PboState::Transferring]);
    assert_eq!(gpu.mapped_buffers(), 1);

    gpu.set_fail_unmap(false);
    dev.transfer(fbo);
    let states: Vec<_> = dev.pbo_states().iter().map(|s| s.state).collect();
    assert_eq!(states, vec![PboState::Transferring, PboState::Ready]);
    assert_eq!(gpu.mapped_buffers(), 0);

    // The frame converted before the failed unmap still went out.
    assert_eq!(firsts(&rec), vec![(0, 0), (0, 9), (0, 9)]);
}

#[test]
fn frames_never_go_out_of_order_after_a_stuck_buffer() {
    let (mut dev, gpu, rec) = device();
    let (tx, rx) = crossbeam_channel::unbounded();
    dev.set_event_sink(tx);
    dev.open(&args(&["--ring-buffer-size", "2"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);

    let mut ready = Vec::new();
    for tick in 1..=5u8 {
        gpu.set_fail_unmap(tick == 2 || tick == 3);
        gpu.fill(fbo, [tick, 0, 0, 255]);
        dev.transfer(fbo);
        ready.push(dev.ready_frame().map(|s| s.id));
    }

    // Tick 3 could not queue a read, so tick 4 has nothing new and sends nothing.
    let sent: Vec<u8> = firsts(&rec).iter().map(|&(_, v)| v).collect();
    assert_eq!(sent, vec![0, 1, 2, 4]);
    assert!(sent.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ready[3], ready[2]);

    let skipped: Vec<_> = rx
        .try_iter()
        .filter_map(|e| match e {
            DeviceEvent::FrameSkipped { channel, reason } => Some((channel, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![(0, SkipReason::Readback)]);
    assert_eq!(dev.tick(), 5);
}

#[test]
fn uyvy_frames_are_subsampled() {
    let (mut dev, gpu, rec) = device();
    dev.set_data_format(2);
    dev.open(&[]);
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    gpu.fill(fbo, [255, 255, 255, 255]);
    dev.transfer(fbo);
    dev.transfer(fbo);

    // the primed slot is mid grey, not zero bytes
    let primed = rec.lock().unwrap().video[0].clone();
    assert_eq!(primed.first, [128, 128, 128, 128]);
    assert_eq!(primed.last, [128, 128, 128, 128]);

    let sent = rec.lock().unwrap().video[1].clone();
    assert_eq!(sent.fourcc, FourCc::Uyvy);
    assert_eq!(sent.stride, 1280 * 2);
    assert_eq!(sent.first, [128, 235, 128, 235]);
    assert_eq!(sent.last, [128, 235, 128, 235]);
}

fn reads_requested(gpu: &HeadlessGpu) -> Vec<PixelLayout> {
    gpu.ops()
        .iter()
        .filter_map(|op| match *op {
            GpuOp::ReadToBuffer { layout, .. } | GpuOp::ReadPixels { layout, .. } => Some(layout),
            _ => None,
        })
        .collect()
}

// Red at full scale, as big-endian 10_10_10_2 with opaque alpha.
const RGB10_RED: [u8; 4] = [0xff, 0xc0, 0x00, 0x03];

#[test]
fn ten_bit_rgb_is_read_reversed_and_sent_big_endian() {
    let (mut dev, gpu, rec) = device();
    dev.set_data_format(4);
    dev.open(&args(&["--ring-buffer-size", "2"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    gpu.fill(fbo, [255, 0, 0, 255]);
    dev.transfer(fbo);
    dev.transfer(fbo);

    assert_eq!(reads_requested(&gpu), vec![PixelLayout::Rgb10A2Rev; 2]);
    let rec = rec.lock().unwrap();
    assert_eq!(rec.video[0].first, [0, 0, 0, 0]);
    let sent = &rec.video[1];
    assert_eq!(sent.fourcc, FourCc::R10b);
    assert_eq!(sent.stride, 1280 * 4);
    assert_eq!(sent.first, RGB10_RED);
    assert_eq!(sent.last, RGB10_RED);
    assert_eq!(u32::from_be_bytes(sent.first), (1023 << 22) | 3);
}

#[test]
fn ten_bit_rgb_direct_readback() {
    let (mut dev, gpu, rec) = device();
    dev.set_data_format(4);
    dev.open(&args(&["--method", "basic"]));
    let fbo = gpu.create_framebuffer(1280, 720);
    gpu.fill(fbo, [255, 0, 0, 255]);
    dev.transfer(fbo);

    assert_eq!(reads_requested(&gpu), vec![PixelLayout::Rgb10A2Rev]);
    assert!(gpu.ops().contains(&GpuOp::ReadPixels { fbo, layout: PixelLayout::Rgb10A2Rev }));
    let sent = rec.lock().unwrap().video[0].clone();
    assert_eq!(sent.fourcc, FourCc::R10b);
    assert_eq!(sent.first, RGB10_RED);
    assert_eq!(sent.last, RGB10_RED);
}

#[test]
fn v210_rows_are_padded_to_whole_blocks() {
    let black_chroma_first = (512u32 | (64 << 10) | (512 << 20)).to_le_bytes();
    let black_luma_first = (64u32 | (512 << 10) | (64 << 20)).to_le_bytes();

    let (mut dev, gpu, rec) = device();
    dev.set_data_format(3);
    dev.open(&args(&["--ring-buffer-size", "2"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    gpu.fill(fbo, [255, 255, 255, 255]);
    dev.transfer(fbo);
    dev.transfer(fbo);

    assert_eq!(reads_requested(&gpu), vec![PixelLayout::Rgb10A2Rev; 2]);
    let rec = rec.lock().unwrap();
    assert_eq!(rec.video[0].first, black_chroma_first);

    let sent = &rec.video[1];
    assert_eq!(sent.fourcc, FourCc::V210);
    // 27 blocks of 48 pixels
    assert_eq!(sent.stride, 3456);
    assert_eq!(sent.first, (512u32 | (940 << 10) | (512 << 20)).to_le_bytes());
    // 214 six-pixel groups fill 3424 bytes; the padding keeps the blank fill
    assert_eq!(sent.last, black_luma_first);
}

#[test]
fn frames_go_out_top_down_unless_disabled() {
    let paint = |gpu: &HeadlessGpu, fbo| {
        gpu.paint(fbo, |_, y| if y < 360 { [255, 0, 0, 255] } else { [0, 0, 255, 255] });
    };

    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--method", "basic"]));
    let fbo = gpu.create_framebuffer(1280, 720);
    paint(&gpu, fbo);
    dev.transfer(fbo);
    let sent = rec.lock().unwrap().video[0].clone();
    assert_eq!(sent.first, [255, 0, 0, 255]);
    assert_eq!(sent.last, [0, 0, 255, 255]);

    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--method", "basic", "--no-vflip"]));
    let fbo = gpu.create_framebuffer(1280, 720);
    paint(&gpu, fbo);
    dev.transfer(fbo);
    let sent = rec.lock().unwrap().video[0].clone();
    assert_eq!(sent.first, [0, 0, 255, 255]);
    assert_eq!(sent.last, [255, 0, 0, 255]);
}

#[test]
fn audio_follows_channel_zero_until_cleared() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--method", "basic"]));
    let fbo = gpu.create_framebuffer(1280, 720);

    dev.transfer(fbo);
    assert!(rec.lock().unwrap().audio.is_empty());

    dev.transfer_audio(Some(&[7u8; 400][..]), 100);
    dev.transfer(fbo);
    dev.transfer(fbo);
    dev.transfer_audio(None, 0);
    dev.transfer(fbo);

    let rec = rec.lock().unwrap();
    let audio = &rec.audio;
    assert_eq!(audio.len(), 2);
    assert_eq!(audio[0].0, 100);
    assert_eq!(audio[0].1, vec![7u8; 400]);
}

#[test]
fn stereo_audio_is_sent_once_per_tick() {
    let (mut dev, gpu, rec) = device();
    dev.open(&args(&["--stereo", "--method", "basic"]));
    let left = gpu.create_framebuffer(1280, 720);
    let right = gpu.create_framebuffer(1280, 720);

    let sink = dev.audio_sink().unwrap();
    thread::spawn(move || sink.transfer_audio(Some(&[1u8; 40][..]), 10)).join().unwrap();
    dev.transfer2(left, right);

    let rec = rec.lock().unwrap();
    assert_eq!(rec.video.len(), 2);
    assert_eq!(rec.audio.len(), 1);
    assert_eq!(rec.audio[0].0, 10);
}

#[test]
fn degraded_session_stays_open_without_transport() {
    let gpu = HeadlessGpu::new();
    let factory: TransportFactory = Box::new(|_cfg: &SenderConfig| -> anyhow::Result<Box<dyn Transport>> {
        anyhow::bail!("no network")
    });
    let mut dev = Device::new("offline", gpu.clone(), factory);
    let (tx, rx) = crossbeam_channel::unbounded();
    dev.set_event_sink(tx);

    dev.open(&[]);
    assert!(dev.is_open());
    assert!(dev.is_degraded());

    let events: Vec<_> = rx.try_iter().collect();
    assert!(matches!(&events[0], DeviceEvent::TransportUnavailable { error } if error.contains("no network")));
    assert!(matches!(events[1], DeviceEvent::Opened { width: 1280, height: 720, fourcc: FourCc::Rgba, ring_size: 5, stereo: false }));

    dev.bind();
    let fbo = gpu.create_framebuffer(1280, 720);
    dev.transfer(fbo);
    dev.transfer(fbo);
    let submitted = rx
        .try_iter()
        .filter(|e| matches!(e, DeviceEvent::FrameSubmitted { channel: 0, audio_samples: 0, .. }))
        .count();
    assert_eq!(submitted, 2);

    dev.close();
    assert!(matches!(rx.try_recv(), Ok(DeviceEvent::Closed)));
}

#[test]
fn close_releases_everything_and_keeps_the_selection() {
    let (mut dev, gpu, rec) = device();
    dev.set_video_format(9);
    dev.set_data_format(2);
    dev.open(&args(&["--name", "studio", "--groups", "a,b", "--no-clock-video"]));
    dev.bind();
    let fbo = gpu.create_framebuffer(1920, 1080);
    dev.transfer(fbo);
    assert!(gpu.is_held(fbo));

    dev.close();
    assert!(!dev.is_open());
    assert!(!gpu.is_held(fbo));
    assert_eq!(gpu.live_buffers(), 0);
    assert!(dev.audio_sink().is_none());

    dev.open(&[]);
    assert_eq!(dev.current_video_format(), 9);
    assert_eq!(dev.current_data_format(), 2);
    assert_eq!((dev.width(), dev.height()), (1920, 1080));
    assert_eq!(dev.output_slot_ids(), vec![0, 1, 2, 3, 4]);

    let configs = rec.lock().unwrap().configs.clone();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].name, "studio");
    assert_eq!(configs[0].groups.as_deref(), Some("a,b"));
    assert!(!configs[0].clock_video);
    assert_eq!((configs[0].rate_n, configs[0].rate_d), (25000, 1000));
    assert_eq!(configs[1].name, "castcore");
    assert!(configs[1].clock_video);
}
