//! Sound-card clock (CPAL output stream).
//!
//! The CPAL callback asks for device-sized buffers; the consumer works in fixed
//! quanta. A pre-allocated planar quantum sits between the two:
//! - a new quantum is pulled from the consumer whenever the previous one is used up
//! - channels are mapped (mono↔stereo, best-effort otherwise)
//! - `f32` samples are converted to the device sample format

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::clock::{AudioClock, ClockFormat};
use crate::consumer::Consumer;
use crate::device;
use crate::error::StreamError;

/// Clock driven by a CPAL output device.
pub struct CpalClock {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    format: ClockFormat,
    stream: Option<cpal::Stream>,
}

impl CpalClock {
    /// Configure `device` for `target_rate` (or its best rate) with `block_frames` quanta.
    pub fn open(device: cpal::Device, target_rate: Option<u32>, block_frames: usize) -> Result<Self> {
        let config = device::pick_output_config(&device, target_rate)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config, block_frames) {
            stream_config.buffer_size = buf;
        }
        let format = ClockFormat {
            sample_rate: stream_config.sample_rate,
            channels: stream_config.channels.clamp(1, 2),
            block_frames,
        };
        tracing::info!(
            rate_hz = format.sample_rate,
            device_channels = stream_config.channels,
            ring_channels = format.channels,
            sample_format = ?config.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            block_frames,
            "device output config"
        );
        Ok(Self {
            device,
            stream_config,
            sample_format: config.sample_format(),
            format,
            stream: None,
        })
    }
}

impl AudioClock for CpalClock {
    fn format(&self) -> ClockFormat {
        self.format
    }

    fn start(&mut self, consumer: Consumer) -> Result<(), StreamError> {
        self.stop();
        let stream = build_output_stream(
            &self.device,
            &self.stream_config,
            self.sample_format,
            consumer,
        )
        .map_err(|e| StreamError::Output(format!("{e:#}")))?;
        stream
            .play()
            .map_err(|e| StreamError::Output(format!("start stream: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!("stream pause: {e}");
            }
        }
    }
}

/// Build a CPAL output stream that plays whatever `consumer` pulls from the ring.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    consumer: Consumer,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, consumer),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, consumer),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, consumer),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, consumer),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    consumer: Consumer,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let mut adapter = QuantumAdapter::new(consumer, config.sample_rate);
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| adapter.fill(data, channels_out, Instant::now()),
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Re-chunks consumer quanta into device buffers of any size.
struct QuantumAdapter {
    consumer: Consumer,
    planar: Vec<Vec<f32>>,
    /// Frames of `planar` already handed to the device.
    pos: usize,
    block: usize,
    sample_rate: u32,
}

impl QuantumAdapter {
    fn new(consumer: Consumer, sample_rate: u32) -> Self {
        let block = consumer.block_frames();
        let planar = vec![vec![0.0f32; block]; consumer.channels()];
        Self {
            consumer,
            planar,
            pos: block,
            block,
            sample_rate,
        }
    }

    fn fill<T>(&mut self, data: &mut [T], channels_out: usize, now: Instant)
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let frames = data.len() / channels_out.max(1);
        for frame in 0..frames {
            if self.pos >= self.block {
                let offset = Duration::from_secs_f64(frame as f64 / self.sample_rate.max(1) as f64);
                self.consumer.process(now + offset, &mut self.planar);
                self.pos = 0;
            }
            for ch in 0..channels_out {
                let sample = mapped_sample(&self.planar, self.pos, channels_out, ch);
                data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
            }
            self.pos += 1;
        }
    }
}

/// Read one output sample for `dst_ch` at `pos`.
///
/// Mapping rules:
/// - mono → any: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the last available source channel
fn mapped_sample(planar: &[Vec<f32>], pos: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    match (planar.len(), dst_channels) {
        (0, _) => 0.0,
        (2, 1) => 0.5 * (planar[0][pos] + planar[1][pos]),
        (1, _) => planar[0][pos],
        (src, _) => planar[dst_ch.min(src - 1)][pos],
    }
}
