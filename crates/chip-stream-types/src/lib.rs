use serde::{Deserialize, Serialize};

/// Lifecycle state of a playback session as seen by the controller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session loaded.
    #[default]
    Idle,
    /// Ring buffer created, waiting for the renderer to acknowledge the track.
    Loading,
    /// Track loaded; playback can start.
    Ready,
    /// Output clock running and renderer streaming.
    Playing,
    /// Output clock halted, buffer and renderer kept.
    Paused,
    /// Track finished or session stopped.
    Ended,
    /// Fatal fault; the session was torn down.
    Error,
}

/// State of the background renderer driver.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProducerState {
    #[default]
    Uninitialized,
    Initializing,
    PreRolling,
    Streaming,
    Stopped,
    Error,
}

/// Reason why a session left the playing state for good.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Engine exhausted and buffer drained.
    Eof,
    /// Engine fault, init failure or control timeout.
    Error,
    /// Explicit stop.
    Stopped,
}

/// Counters reported by the renderer driver.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProducerTelemetry {
    pub state: ProducerState,
    /// Frames written into the ring since the last start.
    pub frames_produced: u64,
    /// Times the ring had no room while occupancy was below the high-watermark.
    pub backpressure_stalls: u64,
    /// Times the ring had no room while already topped up (not a stall).
    pub topup_pauses: u64,
    /// Engine renders that returned nothing while input remained.
    pub empty_renders: u64,
    pub min_occupancy_frames: Option<u64>,
    pub max_occupancy_frames: Option<u64>,
    pub render_avg_us: u64,
    pub render_max_us: u64,
    pub capacity_frames: u64,
}

/// Counters reported by the real-time puller.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumerTelemetry {
    /// Quanta that could not be filled from the ring.
    pub underruns: u64,
    pub frames_consumed: u64,
    pub quanta: u64,
    pub min_occupancy_frames: Option<u64>,
    pub max_occupancy_frames: Option<u64>,
    pub occupancy_frames: u64,
    /// Natural silent quanta plus starvation quanta.
    pub silent_quanta: u64,
    pub missed_quanta: u64,
    pub drift_avg_us: u64,
    pub drift_max_us: u64,
}

/// Merged session view handed to front ends.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub state: SessionState,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub block_frames: Option<u32>,
    pub subtrack: Option<u32>,
    pub duration_hint_ms: Option<u64>,
    /// Elapsed playback time derived from consumed frames.
    pub elapsed_ms: Option<u64>,
    pub producer: ProducerTelemetry,
    pub consumer: ConsumerTelemetry,
    /// Underruns are piling up; playback continues but is audibly broken.
    pub degraded: bool,
    pub end_reason: Option<PlaybackEndReason>,
    pub last_error: Option<String>,
}

impl TelemetrySnapshot {
    /// Recompute `elapsed_ms` from the consumer frame count.
    pub fn refresh_elapsed(&mut self) {
        self.elapsed_ms = match self.sample_rate {
            Some(sr) if sr > 0 => Some(self.consumer.frames_consumed.saturating_mul(1000) / sr as u64),
            _ => None,
        };
    }
}
