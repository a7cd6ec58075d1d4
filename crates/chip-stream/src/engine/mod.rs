//! Synthesis engine seam.
//!
//! The streaming pipeline only needs "render N frames of interleaved PCM"; everything
//! about how a chip tune is emulated or decoded lives behind [`SynthEngine`].

pub mod decoded;
pub mod pulse;
#[cfg(test)]
pub(crate) mod scripted;

use anyhow::Result;

pub use decoded::DecodeEngine;
pub use pulse::{PulseEngine, PulseSong};

/// Borrowed interleaved PCM returned by a render call.
#[derive(Clone, Copy, Debug)]
pub enum Pcm<'a> {
    I16(&'a [i16]),
    F32(&'a [f32]),
}

impl Pcm<'_> {
    pub fn len_samples(&self) -> usize {
        match self {
            Pcm::I16(s) => s.len(),
            Pcm::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len_samples() == 0
    }

    /// Append as `f32` frames with `dst_channels`, mapping channels the same way
    /// the output stage does (mono duplicated, stereo averaged down, otherwise clamped).
    pub fn append_normalized(&self, src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
        let src_channels = src_channels.max(1);
        let frames = self.len_samples() / src_channels;
        out.reserve(frames * dst_channels);
        match *self {
            Pcm::F32(s) => map_frames(s, src_channels, dst_channels, out, |v| v),
            Pcm::I16(s) => map_frames(s, src_channels, dst_channels, out, |v: i16| {
                v as f32 / 32_768.0
            }),
        }
    }
}

fn map_frames<T: Copy>(
    src: &[T],
    src_channels: usize,
    dst_channels: usize,
    out: &mut Vec<f32>,
    to_f32: impl Fn(T) -> f32,
) {
    for frame in src.chunks_exact(src_channels) {
        for dst_ch in 0..dst_channels {
            let v = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (to_f32(frame[0]) + to_f32(frame[1])),
                (1, _) => to_f32(frame[0]),
                _ => to_f32(frame[dst_ch.min(src_channels - 1)]),
            };
            out.push(v);
        }
    }
}

/// What an engine learned about the track it loaded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineInfo {
    /// Channels in rendered PCM.
    pub channels: u16,
    /// Sub-tracks available in the loaded data.
    pub subtracks: u32,
    /// Track length when the data says so.
    pub duration_ms: Option<u64>,
    pub title: Option<String>,
}

/// Opaque frame-rendering capability.
///
/// Engines run on the renderer thread only; they may allocate and take their time.
pub trait SynthEngine: Send {
    fn name(&self) -> &'static str;

    /// Prepare `subtrack` of `track` for rendering at `sample_rate`.
    fn load(&mut self, track: &[u8], subtrack: u32, sample_rate: u32) -> Result<EngineInfo>;

    /// Render up to `frames` frames within roughly `cycle_budget` emulated cycles.
    ///
    /// May return fewer frames near the end of the stream. Returning nothing while
    /// [`SynthEngine::has_more_input`] is still `true` is treated as a stall.
    fn render(&mut self, frames: usize, cycle_budget: u64) -> Result<Pcm<'_>>;

    /// `false` once every frame of the sub-track has been rendered.
    fn has_more_input(&self) -> bool;
}

/// Builds a fresh engine for every session.
pub type EngineFactory = std::sync::Arc<dyn Fn() -> Box<dyn SynthEngine> + Send + Sync>;

/// Built-in engine selection used by front ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    Pulse,
    Decode,
}

impl EngineKind {
    /// Guess from track bytes: `PLS1` songs go to the pulse synth, anything else is decoded.
    pub fn detect(track: &[u8]) -> Self {
        if PulseSong::is_pulse_song(track) {
            EngineKind::Pulse
        } else {
            EngineKind::Decode
        }
    }

    pub fn factory(self) -> EngineFactory {
        match self {
            EngineKind::Pulse => std::sync::Arc::new(|| -> Box<dyn SynthEngine> {
                Box::new(PulseEngine::new())
            }),
            EngineKind::Decode => std::sync::Arc::new(|| -> Box<dyn SynthEngine> {
                Box::new(DecodeEngine::new())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_is_scaled_to_unit_range() {
        let mut out = Vec::new();
        Pcm::I16(&[i16::MIN, 0, 16_384, -16_384]).append_normalized(2, 2, &mut out);
        assert_eq!(out, vec![-1.0, 0.0, 0.5, -0.5]);
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let mut out = Vec::new();
        Pcm::F32(&[0.25, -0.5]).append_normalized(1, 2, &mut out);
        assert_eq!(out, vec![0.25, 0.25, -0.5, -0.5]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let mut out = Vec::new();
        Pcm::F32(&[1.0, 0.0, 0.5, 0.5]).append_normalized(2, 1, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn wide_layouts_clamp_to_last_source_channel() {
        let mut out = Vec::new();
        Pcm::F32(&[0.1, 0.2]).append_normalized(2, 4, &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let mut out = Vec::new();
        Pcm::F32(&[0.1, 0.2, 0.3]).append_normalized(2, 2, &mut out);
        assert_eq!(out, vec![0.1, 0.2]);
    }

    #[test]
    fn detect_routes_pulse_songs() {
        let song = PulseSong::new().subtrack(100, &[[60, 0, 0]]).to_bytes();
        assert_eq!(EngineKind::detect(&song), EngineKind::Pulse);
        assert_eq!(EngineKind::detect(b"RIFF....WAVE"), EngineKind::Decode);
    }
}
