// NDI output.
//
// The sender lives on a worker thread named "ndi" and is fed through a bounded channel.
// Wire formats NDI does not take directly are converted on the calling thread first:
// v210 becomes P216, 10-bit RGB becomes RGBA8, and audio becomes planar float.

use crate::formats::SampleFormat;
use crate::transport::AudioSubmission;

/// Interleaved integer or float samples to planar f32 (channel after channel).
pub fn to_planar_f32(audio: &AudioSubmission<'_>) -> Vec<f32> {
    let ch = audio.channels.max(1);
    let bps = audio.precision.bytes();
    let samples = audio.samples.min(audio.data.len() / (ch * bps));
    let mut out = vec![0.0f32; ch * samples];
    for s in 0..samples {
        for c in 0..ch {
            let o = (s * ch + c) * bps;
            let b = &audio.data[o..o + bps];
            let v = match audio.precision {
                SampleFormat::Int16 => i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0,
                SampleFormat::Int32 => (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2_147_483_648.0) as f32,
                SampleFormat::Float32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            };
            out[c * samples + s] = v;
        }
    }
    out
}

#[cfg(feature = "ndi")]
mod imp {
    use std::thread;

    use crossbeam_channel::{bounded, Sender as ChanSender};
    use grafton_ndi::{AudioFrame, LineStrideOrSize, PixelFormat, ScanType, Sender, SenderOptions, VideoFrame, NDI};

    use super::to_planar_f32;
    use crate::convert;
    use crate::formats::FourCc;
    use crate::transport::{AudioSubmission, SenderConfig, Transport, VideoSubmission};
    use crate::{logi, logw};

    enum NdiMsg {
        Video {
            pixel_format: PixelFormat,
            data: Vec<u8>,
            width: i32,
            height: i32,
            stride: i32,
            rate: (i32, i32),
            aspect: f32,
        },
        Audio {
            sample_rate: i32,
            channels: i32,
            samples: i32,
            planar: Vec<f32>,
        },
        Stop,
    }

    pub struct NdiTransport {
        tx: ChanSender<NdiMsg>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl NdiTransport {
        pub fn new(cfg: &SenderConfig) -> anyhow::Result<Self> {
            let (tx, rx) = bounded::<NdiMsg>(2);
            let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

            let name = cfg.name.clone();
            let groups = cfg.groups.clone();
            let clock_video = cfg.clock_video;

            let worker = thread::Builder::new().name("ndi".to_string()).spawn(move || {
                let ndi = match NDI::new() {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to init NDI: {e:?}")));
                        return;
                    }
                };

                let mut builder = SenderOptions::builder(&name);
                if let Some(g) = groups.as_deref() {
                    builder = builder.groups(g);
                }
                builder = builder.clock_video(clock_video);
                let opts = builder.build();

                let sender = match Sender::new(&ndi, &opts) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to create sender: {e:?}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                logi!("OUTPUT", "NDI sender started: {name}");

                while let Ok(msg) = rx.recv() {
                    match msg {
                        NdiMsg::Video { pixel_format, data, width, height, stride, rate, aspect } => {
                            let frame = VideoFrame::builder()
                                .resolution(width, height)
                                .pixel_format(pixel_format)
                                .frame_rate(rate.0, rate.1)
                                .aspect_ratio(aspect)
                                .scan_type(ScanType::Progressive)
                                .build();
                            match frame {
                                Ok(mut frame) => {
                                    frame.data = data;
                                    frame.line_stride_or_size = LineStrideOrSize::LineStrideBytes(stride);
                                    sender.send_video(&frame);
                                }
                                Err(e) => logw!("OUTPUT", "NDI video frame rejected: {e:?}"),
                            }
                        }
                        NdiMsg::Audio { sample_rate, channels, samples, planar } => {
                            let frame = AudioFrame::builder()
                                .sample_rate(sample_rate)
                                .channels(channels)
                                .samples(samples)
                                .data(planar)
                                .build();
                            match frame {
                                Ok(mut frame) => {
                                    frame.channel_stride_in_bytes = samples * 4;
                                    sender.send_audio(&frame);
                                }
                                Err(e) => logw!("OUTPUT", "NDI audio frame rejected: {e:?}"),
                            }
                        }
                        NdiMsg::Stop => break,
                    }
                }
                logi!("OUTPUT", "NDI sender stopped");
            })?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self { tx, worker: Some(worker) }),
                Ok(Err(msg)) => {
                    let _ = worker.join();
                    anyhow::bail!(msg)
                }
                Err(_) => {
                    let _ = worker.join();
                    anyhow::bail!("NDI worker exited during startup")
                }
            }
        }

        fn push(&self, msg: NdiMsg) -> anyhow::Result<()> {
            // Blocking: a submitted frame is never dropped here.
            self.tx.send(msg).map_err(|_| anyhow::anyhow!("NDI worker is gone"))
        }
    }

    impl Transport for NdiTransport {
        fn send_video(&mut self, frame: &VideoSubmission<'_>) -> anyhow::Result<()> {
            // NDI carries one video stream per sender.
            if frame.channel != 0 {
                return Ok(());
            }
            let (w, h) = (frame.width, frame.height);
            let (pixel_format, data, stride) = match frame.fourcc {
                FourCc::Rgba => (PixelFormat::RGBA, frame.data.to_vec(), frame.line_stride),
                FourCc::Bgra => (PixelFormat::BGRA, frame.data.to_vec(), frame.line_stride),
                FourCc::Uyvy => (PixelFormat::UYVY, frame.data.to_vec(), frame.line_stride),
                FourCc::V210 => {
                    let mut p216 = vec![0u8; convert::p216_bytes(w, h)];
                    convert::v210_to_p216(w, h, frame.data, frame.line_stride, &mut p216);
                    (PixelFormat::P216, p216, w * 2)
                }
                FourCc::R10b => {
                    let mut rgba = vec![0u8; w * h * 4];
                    convert::rgb10_to_rgba8(w, h, frame.data, &mut rgba);
                    (PixelFormat::RGBA, rgba, w * 4)
                }
            };
            self.push(NdiMsg::Video {
                pixel_format,
                data,
                width: w as i32,
                height: h as i32,
                stride: stride as i32,
                rate: (frame.rate_n as i32, frame.rate_d as i32),
                aspect: frame.aspect * w as f32 / h.max(1) as f32,
            })
        }

        fn send_audio(&mut self, audio: &AudioSubmission<'_>) -> anyhow::Result<()> {
            let planar = to_planar_f32(audio);
            let samples = planar.len() / audio.channels.max(1);
            self.push(NdiMsg::Audio {
                sample_rate: audio.sample_rate as i32,
                channels: audio.channels as i32,
                samples: samples as i32,
                planar,
            })
        }
    }

    impl Drop for NdiTransport {
        fn drop(&mut self) {
            let _ = self.tx.send(NdiMsg::Stop);
            if let Some(w) = self.worker.take() {
                let _ = w.join();
            }
        }
    }
}

#[cfg(feature = "ndi")]
pub use imp::NdiTransport;

#[cfg(not(feature = "ndi"))]
pub struct NdiTransport;

#[cfg(not(feature = "ndi"))]
impl NdiTransport {
    pub fn new(_: &crate::transport::SenderConfig) -> anyhow::Result<Self> {
        anyhow::bail!("NDI support not compiled in (enable the `ndi` feature)");
    }
}

#[cfg(not(feature = "ndi"))]
impl crate::transport::Transport for NdiTransport {
    fn send_video(&mut self, _: &crate::transport::VideoSubmission<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_audio(&mut self, _: &AudioSubmission<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
