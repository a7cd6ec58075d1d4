//! Engine for pre-rendered chip tracks (WAV/FLAC/... rips).
//!
//! Uses Symphonia to probe and decode the in-memory track, picking the sub-track by
//! audio track index, and Rubato to convert to the session rate when it differs.
//! Decoding happens lazily inside `render`, so the renderer thread stays the only
//! place that does the work.

use std::io::Cursor;

use anyhow::{Context, Result, anyhow, bail};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{EngineInfo, Pcm, SynthEngine};

const RESAMPLE_CHUNK_FRAMES: usize = 1024;

struct Stream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    eof: bool,
}

struct RateConverter {
    resampler: Box<dyn Resampler<f32>>,
    scratch: Vec<f32>,
    indexing: Indexing,
    src_rate: u64,
    dst_rate: u64,
    /// Source frames handed to the resampler, silence padding excluded.
    fed_frames: u64,
    emitted_frames: u64,
    /// Leading output frames that are filter delay, not signal.
    delay_left: usize,
}

impl RateConverter {
    /// Output frames owed for everything fed so far.
    fn owed_frames(&self) -> u64 {
        (self.fed_frames * self.dst_rate).div_ceil(self.src_rate)
    }

    fn is_drained(&self) -> bool {
        self.emitted_frames >= self.owed_frames()
    }

    /// Resample the first `frames` frames of `input`, zero-padding a short chunk.
    fn process(
        &mut self,
        input: &[f32],
        frames: usize,
        channels: usize,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let input_adapter = InterleavedSlice::new(input, channels, input.len() / channels)
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
        let out_frames = self.scratch.len() / channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.scratch, channels, out_frames)
            .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = (frames < RESAMPLE_CHUNK_FRAMES).then_some(frames);

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process: {e}"))?;
        self.fed_frames += frames as u64;

        let skip = nbr_out.min(self.delay_left);
        self.delay_left -= skip;
        let owed = self.owed_frames().saturating_sub(self.emitted_frames) as usize;
        let keep = (nbr_out - skip).min(owed);
        out.extend_from_slice(&self.scratch[skip * channels..(skip + keep) * channels]);
        self.emitted_frames += keep as u64;
        Ok(())
    }

    /// Push silence through until the filter has released every owed frame.
    fn flush(&mut self, channels: usize, out: &mut Vec<f32>) -> Result<()> {
        if self.is_drained() {
            return Ok(());
        }
        let silence = vec![0.0f32; RESAMPLE_CHUNK_FRAMES * channels];
        while !self.is_drained() {
            let before = (self.emitted_frames, self.delay_left);
            self.process(&silence, 0, channels, out)?;
            if (self.emitted_frames, self.delay_left) == before {
                tracing::warn!(
                    owed = self.owed_frames(),
                    emitted = self.emitted_frames,
                    "resampler stopped producing while flushing"
                );
                self.emitted_frames = self.owed_frames();
            }
        }
        Ok(())
    }
}

/// Decodes a container held in memory; the cycle budget is ignored.
#[derive(Default)]
pub struct DecodeEngine {
    stream: Option<Stream>,
    converter: Option<RateConverter>,
    /// Decoded source-rate samples not yet resampled.
    src_pending: Vec<f32>,
    /// Session-rate samples not yet handed out.
    out_pending: Vec<f32>,
    out: Vec<f32>,
}

impl DecodeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> usize {
        self.stream.as_ref().map(|s| s.channels).unwrap_or(1)
    }

    fn converter_drained(&self) -> bool {
        self.converter.as_ref().is_none_or(RateConverter::is_drained)
    }

    /// Decode one packet of the selected track into `src_pending`.
    fn decode_next(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            bail!("render before load");
        };
        loop {
            let packet = match stream.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    stream.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    stream.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(anyhow!(e).context("read packet")),
            };
            if packet.track_id() != stream.track_id {
                continue;
            }
            let decoded = match stream.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(anyhow!(e).context("decode packet")),
            };
            let mut sample_buf =
                SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            self.src_pending.extend_from_slice(sample_buf.samples());
            return Ok(());
        }
    }

    /// Move source samples into `out_pending`, resampling full chunks (or the tail at EOF).
    /// Once the source is exhausted the filter is flushed so the output length matches
    /// the input duration.
    fn convert_pending(&mut self) -> Result<()> {
        let channels = self.channels();
        let eof = self.stream.as_ref().map(|s| s.eof).unwrap_or(true);
        let Some(conv) = self.converter.as_mut() else {
            self.out_pending.append(&mut self.src_pending);
            return Ok(());
        };

        let chunk_samples = RESAMPLE_CHUNK_FRAMES * channels;
        let mut consumed = 0;
        while self.src_pending.len() - consumed >= chunk_samples
            || (eof && self.src_pending.len() > consumed)
        {
            let frames = ((self.src_pending.len() - consumed) / channels).min(RESAMPLE_CHUNK_FRAMES);
            if frames == 0 {
                consumed = self.src_pending.len();
                break;
            }
            let input = &self.src_pending[consumed..consumed + frames * channels];
            conv.process(input, frames, channels, &mut self.out_pending)?;
            consumed += frames * channels;
        }
        self.src_pending.drain(..consumed);
        if eof && self.src_pending.is_empty() {
            conv.flush(channels, &mut self.out_pending)?;
        }
        Ok(())
    }
}

impl SynthEngine for DecodeEngine {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn load(&mut self, track: &[u8], subtrack: u32, sample_rate: u32) -> Result<EngineInfo> {
        if sample_rate == 0 {
            bail!("sample rate must be > 0");
        }
        let mss = MediaSourceStream::new(Box::new(Cursor::new(track.to_vec())), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe track")?;
        let format = probed.format;

        let audio_tracks: Vec<_> = format
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .collect();
        let subtracks = audio_tracks.len() as u32;
        let track = audio_tracks
            .get(subtrack as usize)
            .ok_or_else(|| anyhow!("sub-track {subtrack} out of range (found {subtracks})"))?;

        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;
        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        let src_rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;
        let duration_ms = duration_ms_from_codec_params(&codec_params);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("make decoder")?;

        *self = Self::default();
        if src_rate != sample_rate {
            self.converter = Some(make_converter(src_rate, sample_rate, channels)?);
            tracing::info!(from_hz = src_rate, to_hz = sample_rate, "resampling");
        } else {
            tracing::info!(rate_hz = sample_rate, "resample skipped");
        }
        self.stream = Some(Stream {
            format,
            decoder,
            track_id,
            channels,
            eof: false,
        });

        Ok(EngineInfo {
            channels: channels as u16,
            subtracks,
            duration_ms,
            title: None,
        })
    }

    fn render(&mut self, frames: usize, _cycle_budget: u64) -> Result<Pcm<'_>> {
        let channels = self.channels();
        let want = frames * channels;
        while self.out_pending.len() < want {
            let eof = match self.stream.as_ref() {
                Some(s) => s.eof,
                None => bail!("render before load"),
            };
            if eof && self.src_pending.is_empty() && self.converter_drained() {
                break;
            }
            if !eof {
                self.decode_next()?;
            }
            self.convert_pending()?;
        }

        let take = want.min(self.out_pending.len()) / channels * channels;
        self.out.clear();
        self.out.extend(self.out_pending.drain(..take));
        Ok(Pcm::F32(&self.out))
    }

    fn has_more_input(&self) -> bool {
        let eof = self.stream.as_ref().map(|s| s.eof).unwrap_or(true);
        !eof
            || !self.src_pending.is_empty()
            || !self.converter_drained()
            || self.out_pending.len() >= self.channels()
    }
}

fn make_converter(src_rate: u32, dst_rate: u32, channels: usize) -> Result<RateConverter> {
    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let oversampling_factor = 256;
    let interpolation = SincInterpolationType::Cubic;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation,
        oversampling_factor,
        window,
    };

    let resampler = Async::<f32>::new_sinc(
        f_ratio,
        1.1,
        &params,
        RESAMPLE_CHUNK_FRAMES,
        channels,
        FixedAsync::Input,
    )
    .map_err(|e| anyhow!("resampler init: {e}"))?;

    let headroom = (f_ratio.ceil() as usize).max(1) + 2;
    let delay_left = resampler.output_delay();
    Ok(RateConverter {
        resampler: Box::new(resampler),
        scratch: vec![0.0f32; channels * RESAMPLE_CHUNK_FRAMES * headroom],
        indexing: Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        },
        src_rate: src_rate as u64,
        dst_rate: dst_rate as u64,
        fed_frames: 0,
        emitted_frames: 0,
        delay_left,
    })
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}
