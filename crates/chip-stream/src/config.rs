//! Streaming tuning parameters shared by the controller, renderer driver and puller.
//!
//! Every value has a default; a TOML file may override any subset of them.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Buffering heuristics used to derive a [`crate::strategy::BufferingStrategy`].
///
/// These are engine-specific and empirically tuned, so they stay configurable.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyConfig {
    /// Pre-roll target as a fraction of ring capacity.
    pub pre_roll_ratio: f32,
    /// Lower bound for the pre-roll target in frames.
    pub min_pre_roll_frames: usize,
    /// Preferred render request size in frames before alignment and bounding.
    pub render_chunk_frames: usize,
    /// Upper bound for a render request as a fraction of ring capacity.
    pub max_chunk_ratio: f32,
    /// Emulated chip cycles needed per output frame.
    pub cycles_per_frame: f64,
    /// Occupancy (as a fraction of the pre-roll target) above which a full ring
    /// is an intentional top-up pause rather than a backpressure stall.
    pub high_watermark_ratio: f32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            pre_roll_ratio: 0.30,
            min_pre_roll_frames: 1024,
            render_chunk_frames: 2048,
            max_chunk_ratio: 0.25,
            cycles_per_frame: 81.0,
            high_watermark_ratio: 0.9,
        }
    }
}

/// Top-level streaming configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    /// Ring capacity target expressed as audio duration.
    pub buffer_latency_ms: u32,
    /// Quantum size requested by the output clock.
    pub block_frames: usize,
    pub strategy: StrategyConfig,
    /// Consecutive empty renders tolerated before declaring an engine fault.
    pub max_empty_renders: u32,
    /// Deadline for control acknowledgments (load).
    pub control_timeout: Duration,
    /// Deadline for pre-roll completion after `play()`.
    pub ready_timeout: Duration,
    /// How often the renderer driver publishes telemetry.
    pub producer_telemetry_interval: Duration,
    /// How many quanta between puller telemetry reports.
    pub consumer_telemetry_interval_quanta: u32,
    /// How many quanta between "is this quantum silent" checks.
    pub silence_check_interval_quanta: u32,
    /// Minimum quanta between two underrun log lines.
    pub underrun_log_interval_quanta: u32,
    /// Underruns between two puller reports that flag playback as degraded.
    pub degraded_underrun_threshold: u64,
}

impl Default for StreamConfig {
    /// Defaults tuned for ~350 ms of buffering at common rates.
    fn default() -> Self {
        Self {
            buffer_latency_ms: 350,
            block_frames: 128,
            strategy: StrategyConfig::default(),
            max_empty_renders: 50,
            control_timeout: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(5),
            producer_telemetry_interval: Duration::from_millis(500),
            consumer_telemetry_interval_quanta: 128,
            silence_check_interval_quanta: 16,
            underrun_log_interval_quanta: 512,
            degraded_underrun_threshold: 8,
        }
    }
}

/// On-disk representation; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfigFile {
    pub buffer_latency_ms: Option<u32>,
    pub block_frames: Option<usize>,
    pub max_empty_renders: Option<u32>,
    pub control_timeout_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub producer_telemetry_interval_ms: Option<u64>,
    pub consumer_telemetry_interval_quanta: Option<u32>,
    pub silence_check_interval_quanta: Option<u32>,
    pub underrun_log_interval_quanta: Option<u32>,
    pub degraded_underrun_threshold: Option<u64>,
    pub strategy: Option<StrategyConfigFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfigFile {
    pub pre_roll_ratio: Option<f32>,
    pub min_pre_roll_frames: Option<usize>,
    pub render_chunk_frames: Option<usize>,
    pub max_chunk_ratio: Option<f32>,
    pub cycles_per_frame: Option<f64>,
    pub high_watermark_ratio: Option<f32>,
}

impl StreamConfig {
    /// Load overrides from a TOML file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file = toml::from_str::<StreamConfigFile>(raw)?;
        let mut cfg = Self::default();
        cfg.apply(file);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay every key present in `file`.
    pub fn apply(&mut self, file: StreamConfigFile) {
        if let Some(v) = file.buffer_latency_ms {
            self.buffer_latency_ms = v;
        }
        if let Some(v) = file.block_frames {
            self.block_frames = v;
        }
        if let Some(v) = file.max_empty_renders {
            self.max_empty_renders = v;
        }
        if let Some(v) = file.control_timeout_ms {
            self.control_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.ready_timeout_ms {
            self.ready_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.producer_telemetry_interval_ms {
            self.producer_telemetry_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.consumer_telemetry_interval_quanta {
            self.consumer_telemetry_interval_quanta = v;
        }
        if let Some(v) = file.silence_check_interval_quanta {
            self.silence_check_interval_quanta = v;
        }
        if let Some(v) = file.underrun_log_interval_quanta {
            self.underrun_log_interval_quanta = v;
        }
        if let Some(v) = file.degraded_underrun_threshold {
            self.degraded_underrun_threshold = v;
        }
        if let Some(s) = file.strategy {
            let st = &mut self.strategy;
            if let Some(v) = s.pre_roll_ratio {
                st.pre_roll_ratio = v;
            }
            if let Some(v) = s.min_pre_roll_frames {
                st.min_pre_roll_frames = v;
            }
            if let Some(v) = s.render_chunk_frames {
                st.render_chunk_frames = v;
            }
            if let Some(v) = s.max_chunk_ratio {
                st.max_chunk_ratio = v;
            }
            if let Some(v) = s.cycles_per_frame {
                st.cycles_per_frame = v;
            }
            if let Some(v) = s.high_watermark_ratio {
                st.high_watermark_ratio = v;
            }
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_frames == 0 {
            anyhow::bail!("block_frames must be > 0");
        }
        if self.buffer_latency_ms == 0 {
            anyhow::bail!("buffer_latency_ms must be > 0");
        }
        let st = &self.strategy;
        if !(st.pre_roll_ratio.is_finite() && st.pre_roll_ratio > 0.0 && st.pre_roll_ratio < 1.0) {
            anyhow::bail!("strategy.pre_roll_ratio must be in (0, 1)");
        }
        if !(st.max_chunk_ratio.is_finite() && st.max_chunk_ratio > 0.0) {
            anyhow::bail!("strategy.max_chunk_ratio must be > 0");
        }
        if !(st.cycles_per_frame.is_finite() && st.cycles_per_frame > 0.0) {
            anyhow::bail!("strategy.cycles_per_frame must be > 0");
        }
        if !(st.high_watermark_ratio.is_finite() && st.high_watermark_ratio > 0.0) {
            anyhow::bail!("strategy.high_watermark_ratio must be > 0");
        }
        Ok(())
    }

    /// Ring capacity in frames for `sample_rate`, rounded up to whole blocks.
    pub fn capacity_frames_for(&self, sample_rate: u32) -> usize {
        let block = self.block_frames.max(1);
        let frames = (sample_rate as u64 * self.buffer_latency_ms as u64).div_ceil(1000) as usize;
        frames.div_ceil(block).max(4) * block
    }
}
