//! Built-in pulse/noise chip synthesizer.
//!
//! Songs use a compact `PLS1` layout:
//!
//! ```text
//! "PLS1"                      magic
//! u8                          sub-track count
//! u32 LE * count              byte offset of each sub-track
//! per sub-track:
//!   u16 LE row_ms             length of one row
//!   u16 LE row_count
//!   [u8; 3] * row_count       pulse A note, pulse B note, noise (hi nibble period, lo nibble volume)
//! ```
//!
//! Notes are MIDI numbers, 0 is a rest. The emulated chip runs at [`CHIP_CLOCK_HZ`];
//! a render call never spends more than its cycle budget.

use anyhow::{Context, Result, anyhow, bail};

use super::{EngineInfo, Pcm, SynthEngine};

const MAGIC: &[u8; 4] = b"PLS1";
pub const CHIP_CLOCK_HZ: u64 = 1_789_773;
const CHANNELS: usize = 2;

const NOISE_PERIODS: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Builder for `PLS1` song bytes.
#[derive(Clone, Debug, Default)]
pub struct PulseSong {
    subtracks: Vec<(u16, Vec<[u8; 3]>)>,
}

impl PulseSong {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subtrack(mut self, row_ms: u16, rows: &[[u8; 3]]) -> Self {
        self.subtracks.push((row_ms, rows.to_vec()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(self.subtracks.len() as u8);
        let mut offset = 5 + 4 * self.subtracks.len();
        for (_, rows) in &self.subtracks {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += 4 + rows.len() * 3;
        }
        for (row_ms, rows) in &self.subtracks {
            out.extend_from_slice(&row_ms.to_le_bytes());
            out.extend_from_slice(&(rows.len() as u16).to_le_bytes());
            for row in rows {
                out.extend_from_slice(row);
            }
        }
        out
    }

    pub fn is_pulse_song(bytes: &[u8]) -> bool {
        bytes.len() >= 5 && &bytes[..4] == MAGIC
    }

    /// A short two-voice arpeggio, handy for smoke tests and demos.
    pub fn demo() -> Self {
        let mut rows = Vec::new();
        for bar in 0..8u8 {
            let root = [57u8, 53, 48, 55][(bar % 4) as usize];
            for step in 0..8u8 {
                let arp = [0u8, 4, 7, 12][(step % 4) as usize];
                let noise = if step % 4 == 0 { 0x3a } else if step % 2 == 0 { 0x14 } else { 0 };
                rows.push([root + 12 + arp, if step % 2 == 0 { root } else { 0 }, noise]);
            }
        }
        Self::new().subtrack(125, &rows).subtrack(250, &rows[..16])
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Row {
    pulse_a: u8,
    pulse_b: u8,
    noise: u8,
}

#[derive(Debug, Default)]
struct PulseVoice {
    phase: f32,
    step: f32,
    duty: f32,
    amp: f32,
}

impl PulseVoice {
    fn set_note(&mut self, note: u8, sample_rate: u32) {
        if note == 0 {
            self.amp = 0.0;
            return;
        }
        let hz = 440.0 * 2f32.powf((note as f32 - 69.0) / 12.0);
        self.step = hz / sample_rate as f32;
        self.amp = 0.18;
    }

    fn next(&mut self) -> f32 {
        if self.amp == 0.0 {
            return 0.0;
        }
        self.phase = (self.phase + self.step).fract();
        if self.phase < self.duty { self.amp } else { -self.amp }
    }
}

#[derive(Debug)]
struct NoiseVoice {
    lfsr: u16,
    period_cycles: u64,
    counter: u64,
    amp: f32,
}

impl Default for NoiseVoice {
    fn default() -> Self {
        Self {
            lfsr: 1,
            period_cycles: NOISE_PERIODS[0] as u64,
            counter: 0,
            amp: 0.0,
        }
    }
}

impl NoiseVoice {
    fn set(&mut self, noise: u8) {
        self.period_cycles = NOISE_PERIODS[(noise >> 4) as usize] as u64;
        self.amp = (noise & 0x0f) as f32 / 15.0 * 0.12;
    }

    fn clock(&mut self, cycles: u64) -> f32 {
        self.counter += cycles;
        while self.counter >= self.period_cycles {
            self.counter -= self.period_cycles;
            let bit = (self.lfsr ^ (self.lfsr >> 1)) & 1;
            self.lfsr = (self.lfsr >> 1) | (bit << 14);
        }
        if self.lfsr & 1 == 0 { self.amp } else { -self.amp }
    }
}

/// Two pulse voices plus an LFSR noise voice, rendered as stereo `i16`.
#[derive(Debug, Default)]
pub struct PulseEngine {
    rows: Vec<Row>,
    sample_rate: u32,
    frames_per_row: u64,
    frame_in_row: u64,
    row: usize,
    /// Chip cycles per output frame in 16.16 fixed point.
    cycles_per_frame_fp: u64,
    cycle_remainder_fp: u64,
    voice_a: PulseVoice,
    voice_b: PulseVoice,
    noise: NoiseVoice,
    out: Vec<i16>,
}

impl PulseEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_row(&mut self) {
        let Some(row) = self.rows.get(self.row).copied() else {
            return;
        };
        self.voice_a.set_note(row.pulse_a, self.sample_rate);
        self.voice_b.set_note(row.pulse_b, self.sample_rate);
        self.noise.set(row.noise);
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    let raw = bytes
        .get(at..at + 2)
        .ok_or_else(|| anyhow!("truncated at byte {at}"))?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let raw = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("truncated at byte {at}"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

impl SynthEngine for PulseEngine {
    fn name(&self) -> &'static str {
        "pulse"
    }

    fn load(&mut self, track: &[u8], subtrack: u32, sample_rate: u32) -> Result<EngineInfo> {
        if !PulseSong::is_pulse_song(track) {
            bail!("not a PLS1 song");
        }
        if sample_rate == 0 {
            bail!("sample rate must be > 0");
        }
        let count = track[4] as u32;
        if subtrack >= count {
            bail!("sub-track {subtrack} out of range (song has {count})");
        }
        let offset = read_u32(track, 5 + 4 * subtrack as usize)
            .context("sub-track table")? as usize;
        let row_ms = read_u16(track, offset).context("sub-track header")?.max(1);
        let row_count = read_u16(track, offset + 2).context("sub-track header")? as usize;
        let body = track
            .get(offset + 4..offset + 4 + row_count * 3)
            .ok_or_else(|| anyhow!("sub-track {subtrack} rows truncated"))?;

        *self = Self::default();
        self.rows = body
            .chunks_exact(3)
            .map(|r| Row {
                pulse_a: r[0].min(127),
                pulse_b: r[1].min(127),
                noise: r[2],
            })
            .collect();
        self.sample_rate = sample_rate;
        self.frames_per_row = (row_ms as u64 * sample_rate as u64 / 1000).max(1);
        self.cycles_per_frame_fp = (CHIP_CLOCK_HZ << 16) / sample_rate as u64;
        self.voice_a.duty = 0.5;
        self.voice_b.duty = 0.25;
        self.apply_row();

        tracing::debug!(
            subtrack,
            rows = self.rows.len(),
            row_ms,
            sample_rate,
            "pulse song loaded"
        );
        Ok(EngineInfo {
            channels: CHANNELS as u16,
            subtracks: count,
            duration_ms: Some(row_ms as u64 * row_count as u64),
            title: Some(format!("PLS1 #{subtrack}")),
        })
    }

    fn render(&mut self, frames: usize, cycle_budget: u64) -> Result<Pcm<'_>> {
        self.out.clear();
        if self.cycles_per_frame_fp == 0 {
            bail!("render before load");
        }
        let affordable = ((cycle_budget as u128) << 16) / self.cycles_per_frame_fp as u128;
        let frames = frames.min(affordable.min(usize::MAX as u128) as usize);

        for _ in 0..frames {
            if self.row >= self.rows.len() {
                break;
            }
            self.cycle_remainder_fp += self.cycles_per_frame_fp;
            let cycles = self.cycle_remainder_fp >> 16;
            self.cycle_remainder_fp &= 0xffff;

            let a = self.voice_a.next();
            let b = self.voice_b.next();
            let n = self.noise.clock(cycles);
            let left = (a * 0.7 + b * 0.3 + n).clamp(-1.0, 1.0);
            let right = (a * 0.3 + b * 0.7 + n).clamp(-1.0, 1.0);
            self.out.push((left * 32_767.0) as i16);
            self.out.push((right * 32_767.0) as i16);

            self.frame_in_row += 1;
            if self.frame_in_row >= self.frames_per_row {
                self.frame_in_row = 0;
                self.row += 1;
                self.apply_row();
            }
        }
        Ok(Pcm::I16(&self.out))
    }

    fn has_more_input(&self) -> bool {
        self.row < self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered_frames(engine: &mut PulseEngine, frames: usize, budget: u64) -> usize {
        engine.render(frames, budget).unwrap().len_samples() / CHANNELS
    }

    #[test]
    fn song_bytes_roundtrip_through_loader() {
        let bytes = PulseSong::new()
            .subtrack(10, &[[60, 0, 0], [62, 0, 0]])
            .subtrack(20, &[[64, 67, 0x3f]])
            .to_bytes();
        let mut engine = PulseEngine::new();
        let info = engine.load(&bytes, 1, 8_000).unwrap();
        assert_eq!(info.subtracks, 2);
        assert_eq!(info.channels, 2);
        assert_eq!(info.duration_ms, Some(20));
    }

    #[test]
    fn renders_exactly_the_song_length() {
        let bytes = PulseSong::new()
            .subtrack(10, &[[60, 0, 0], [0, 0, 0], [72, 48, 0x2f]])
            .to_bytes();
        let mut engine = PulseEngine::new();
        engine.load(&bytes, 0, 8_000).unwrap();
        // 3 rows of 80 frames each.
        let mut total = 0;
        while engine.has_more_input() {
            let got = rendered_frames(&mut engine, 64, u64::MAX);
            assert!(got > 0);
            total += got;
        }
        assert_eq!(total, 240);
        assert_eq!(rendered_frames(&mut engine, 64, u64::MAX), 0);
    }

    #[test]
    fn cycle_budget_caps_frames() {
        let bytes = PulseSong::demo().to_bytes();
        let mut engine = PulseEngine::new();
        engine.load(&bytes, 0, 44_100).unwrap();
        // ~40.6 cycles per frame at 44.1 kHz.
        let got = rendered_frames(&mut engine, 1_000, 406);
        assert!((9..=10).contains(&got), "got {got}");
        assert_eq!(rendered_frames(&mut engine, 1_000, 0), 0);
        assert!(engine.has_more_input());
    }

    #[test]
    fn rest_rows_are_silent() {
        let bytes = PulseSong::new().subtrack(10, &[[0, 0, 0]]).to_bytes();
        let mut engine = PulseEngine::new();
        engine.load(&bytes, 0, 8_000).unwrap();
        match engine.render(80, u64::MAX).unwrap() {
            Pcm::I16(s) => assert!(s.iter().all(|v| *v == 0)),
            Pcm::F32(_) => panic!("pulse engine renders i16"),
        }
    }

    #[test]
    fn rejects_bad_input() {
        let mut engine = PulseEngine::new();
        assert!(engine.load(b"nope", 0, 44_100).is_err());
        let bytes = PulseSong::new().subtrack(10, &[[60, 0, 0]]).to_bytes();
        assert!(engine.load(&bytes, 1, 44_100).is_err());
        assert!(engine.load(&bytes[..bytes.len() - 1], 0, 44_100).is_err());
        assert!(engine.load(&bytes, 0, 0).is_err());
    }

    #[test]
    fn render_before_load_fails() {
        let mut engine = PulseEngine::new();
        assert!(engine.render(16, 1_000).is_err());
    }
}
