//! # castcore headless runner
//!
//! Drives the output device the way a renderer would, without a window: every tick paints a
//! test pattern into a software framebuffer, feeds a tone into the audio buffer and calls
//! `transfer`. Frames go to the NDI sender (`--ndi`, needs the `ndi` feature) or to a sink
//! that only counts them.
//!
//! ```text
//! castcore --list
//! castcore --frames 300 --video-format 10 --data-format 2 -- --ring-buffer-size 3 --verbose
//! castcore --ndi --stereo-eyes -- --stereo --name studio-a
//! ```
//!
//! Everything after `--` is handed to the device unchanged (see the device options below).

use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use castcore_engine::config;
use castcore_engine::formats::{AudioFormatDescriptor, SampleFormat};
use castcore_engine::gpu::{FramebufferId, HeadlessGpu};
use castcore_engine::transport::{self, TransportStats};
use castcore_engine::{logging, Device, DeviceEvent};
use castcore_engine::{logi, logw};

const TONE_HZ: f64 = 1000.0;
const BAR_WIDTH: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "castcore", about = "Headless castcore output runner", after_help = device_help())]
struct Cli {
    /// Also append every log line to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Output ticks to run
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Video format index (see --list)
    #[arg(long, default_value_t = 0)]
    video_format: usize,

    /// Data format index for the selected video format
    #[arg(long, default_value_t = 0)]
    data_format: usize,

    /// Audio format index
    #[arg(long, default_value_t = 0)]
    audio_format: usize,

    /// Print the format catalog and exit
    #[arg(long)]
    list: bool,

    /// Render two eyes and send them with transfer2
    #[arg(long)]
    stereo_eyes: bool,

    /// Publish through NDI instead of counting frames
    #[arg(long)]
    ndi: bool,

    /// Run as fast as possible instead of at the format's frame rate
    #[arg(long)]
    no_pace: bool,

    /// Device options
    #[arg(last = true)]
    device_args: Vec<String>,
}

fn device_help() -> String {
    format!("Device options (after --):\n{}", config::usage())
}

#[derive(Debug, Default)]
struct EventTally {
    submitted: u64,
    skipped: u64,
}

fn list_formats(dev: &Device<HeadlessGpu>) {
    for i in 0..dev.num_video_formats() {
        let v = dev.video_format_at_index(i);
        logi!("FORMATS", "video {i:>2}: {} ({}x{} @ {}/{})", v.description, v.width, v.height, v.rate_n, v.rate_d);
    }
    for i in 0..dev.num_data_formats() {
        let d = dev.data_format_at_index(i);
        logi!("FORMATS", "data  {i:>2}: {}", d.description);
    }
    for i in 0..dev.num_audio_formats() {
        logi!("FORMATS", "audio {i:>2}: {}", dev.audio_format_at_index(i).description);
    }
    for i in 0..dev.num_sync_modes() {
        logi!("FORMATS", "sync  {i:>2}: {}", dev.sync_mode_at_index(i).description);
    }
}

/// Interleaved sine tone, `samples` frames starting at absolute sample `start`.
fn tone(format: &AudioFormatDescriptor, samples: usize, start: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples * format.frame_bytes());
    for s in 0..samples {
        let t = (start + s as u64) as f64 / format.sample_rate as f64;
        let v = (t * TONE_HZ * TAU).sin() * 0.25;
        for _ in 0..format.channels {
            match format.precision {
                SampleFormat::Int16 => out.extend_from_slice(&((v * i16::MAX as f64) as i16).to_le_bytes()),
                SampleFormat::Int32 => out.extend_from_slice(&((v * i32::MAX as f64) as i32).to_le_bytes()),
                SampleFormat::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            }
        }
    }
    out
}

/// Gradient with a white bar sweeping left to right.
fn paint_pattern(gpu: &HeadlessGpu, fbo: FramebufferId, width: usize, height: usize, tick: u64, offset: usize) {
    let bar = (tick as usize * 8 + offset) % width.max(1);
    gpu.paint(fbo, |x, y| {
        if x >= bar && x < bar + BAR_WIDTH {
            [255, 255, 255, 255]
        } else {
            [(x * 255 / width) as u8, (y * 255 / height.max(1)) as u8, (tick % 256) as u8, 255]
        }
    });
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let run_id = logging::init(cli.log_file.clone());
    logi!("RUN", "castcore runner (run {run_id})");

    let gpu = HeadlessGpu::new();
    let stats = Arc::new(TransportStats::default());
    let factory = if cli.ndi { transport::ndi_factory() } else { transport::null_factory(stats.clone()) };
    let mut dev = Device::new("castcore", gpu.clone(), factory);

    dev.set_video_format(cli.video_format);
    dev.set_data_format(cli.data_format);
    dev.set_audio_format(cli.audio_format);

    if cli.list {
        list_formats(&dev);
        return Ok(());
    }

    let (tx, rx) = crossbeam_channel::bounded::<DeviceEvent>(1024);
    dev.set_event_sink(tx);
    let monitor = thread::Builder::new()
        .name("events".to_string())
        .spawn(move || {
            let mut tally = EventTally::default();
            for ev in rx.iter() {
                match ev {
                    DeviceEvent::FrameSubmitted { .. } => tally.submitted += 1,
                    DeviceEvent::FrameSkipped { channel, reason } => {
                        tally.skipped += 1;
                        logw!("EVENT", "channel {channel} skipped: {reason:?}");
                    }
                    other => logi!("EVENT", "{other:?}"),
                }
            }
            tally
        })
        .context("spawn event thread")?;

    dev.open(&cli.device_args);
    if cli.stereo_eyes {
        dev.bind2();
    } else {
        dev.bind();
    }

    let (w, h) = (dev.width(), dev.height());
    let left = gpu.create_framebuffer(w, h);
    let right = gpu.create_framebuffer(w, h);
    let audio_format = *dev.audio_format_at_index(dev.current_audio_format());
    let cadence = dev.audio_frame_size_sequence();
    let sink = dev.audio_sink();
    let frame_dt = dev.timing().frame_duration();
    let report_every = dev.timing().hertz.round().max(1.0) as u64;
    logi!("RUN", "{} ticks of {}x{}, audio cadence {:?}", cli.frames, w, h, cadence);

    let start = Instant::now();
    let mut sample_pos = 0u64;
    for tick in 0..cli.frames {
        let samples = cadence[(tick % cadence.len() as u64) as usize];
        if let Some(sink) = &sink {
            let pcm = tone(&audio_format, samples, sample_pos);
            sink.transfer_audio(Some(pcm.as_slice()), samples);
        }
        sample_pos += samples as u64;

        paint_pattern(&gpu, left, w, h, tick, 0);
        if cli.stereo_eyes {
            paint_pattern(&gpu, right, w, h, tick, w / 16);
            dev.transfer2(left, right);
        } else {
            dev.transfer(left);
        }

        if (tick + 1) % report_every == 0 {
            logi!("RUN", "tick {}: {} video / {} audio frames sent", dev.tick(), stats.video_frames(), stats.audio_frames());
        }

        if !cli.no_pace {
            let next = start + Duration::from_secs_f64(frame_dt * (tick + 1) as f64);
            if let Some(wait) = next.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    dev.unbind();
    dev.close();
    drop(dev);

    let tally = monitor.join().map_err(|_| anyhow::anyhow!("event thread panicked"))?;
    logi!(
        "RUN",
        "done: {} ticks in {:.2}s ({:.2} fps), {} submitted, {} skipped, {} audio samples",
        cli.frames,
        elapsed,
        cli.frames as f64 / elapsed.max(f64::EPSILON),
        tally.submitted,
        tally.skipped,
        stats.audio_samples()
    );
    Ok(())
}
