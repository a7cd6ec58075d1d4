//! Deterministic engine for pipeline tests.

use anyhow::{Result, bail};

use super::{EngineInfo, Pcm, SynthEngine};

/// Renders a constant level, optionally ending or stalling after a number of frames.
#[derive(Clone, Debug)]
pub(crate) struct ScriptedEngine {
    pub channels: u16,
    pub level: f32,
    /// End of stream after this many frames.
    pub total_frames: Option<usize>,
    /// Return nothing (while claiming more input) once this many frames were produced.
    pub stall_after: Option<usize>,
    pub fail_load: bool,
    produced: usize,
    buf: Vec<f32>,
}

impl ScriptedEngine {
    pub(crate) fn endless() -> Self {
        Self {
            channels: 2,
            level: 0.25,
            total_frames: None,
            stall_after: None,
            fail_load: false,
            produced: 0,
            buf: Vec::new(),
        }
    }

    pub(crate) fn finite(frames: usize) -> Self {
        Self {
            total_frames: Some(frames),
            ..Self::endless()
        }
    }

    pub(crate) fn stalling_after(frames: usize) -> Self {
        Self {
            stall_after: Some(frames),
            ..Self::endless()
        }
    }

    pub(crate) fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::endless()
        }
    }
}

impl SynthEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&mut self, _track: &[u8], _subtrack: u32, _sample_rate: u32) -> Result<EngineInfo> {
        if self.fail_load {
            bail!("scripted load failure");
        }
        self.produced = 0;
        Ok(EngineInfo {
            channels: self.channels,
            subtracks: 1,
            duration_ms: None,
            title: None,
        })
    }

    fn render(&mut self, frames: usize, _cycle_budget: u64) -> Result<Pcm<'_>> {
        let mut n = frames;
        if let Some(total) = self.total_frames {
            n = n.min(total.saturating_sub(self.produced));
        }
        if let Some(stall) = self.stall_after {
            n = n.min(stall.saturating_sub(self.produced));
        }
        self.produced += n;
        self.buf.clear();
        self.buf.resize(n * self.channels as usize, self.level);
        Ok(Pcm::F32(&self.buf))
    }

    fn has_more_input(&self) -> bool {
        self.total_frames.is_none_or(|t| self.produced < t)
    }
}
