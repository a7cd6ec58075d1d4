//! Telemetry accumulation on each side of the ring and the merged session view.
//!
//! The renderer driver and the real-time puller each own a plain stats struct
//! (no atomics, no locks) and publish copies of it over channels. The controller's
//! monitor folds those copies into one [`TelemetrySnapshot`].

use std::time::Duration;

use chip_stream_types::{
    ConsumerTelemetry, PlaybackEndReason, ProducerState, ProducerTelemetry, SessionState,
    TelemetrySnapshot,
};

/// Running min/max of an occupancy gauge.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OccupancyRange {
    min: Option<u64>,
    max: Option<u64>,
}

impl OccupancyRange {
    #[inline]
    pub(crate) fn observe(&mut self, frames: usize) {
        let v = frames as u64;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    pub(crate) fn min(&self) -> Option<u64> {
        self.min
    }

    pub(crate) fn max(&self) -> Option<u64> {
        self.max
    }
}

/// Renderer-side counters, reset on every start.
#[derive(Clone, Debug, Default)]
pub(crate) struct ProducerStats {
    pub frames_produced: u64,
    pub backpressure_stalls: u64,
    pub topup_pauses: u64,
    pub empty_renders: u64,
    occupancy: OccupancyRange,
    renders: u64,
    render_total: Duration,
    render_max: Duration,
}

impl ProducerStats {
    pub(crate) fn observe_occupancy(&mut self, frames: usize) {
        self.occupancy.observe(frames);
    }

    pub(crate) fn record_render(&mut self, took: Duration) {
        self.renders += 1;
        self.render_total += took;
        self.render_max = self.render_max.max(took);
    }

    pub(crate) fn report(&self, state: ProducerState, capacity_frames: usize) -> ProducerTelemetry {
        let render_avg_us = if self.renders == 0 {
            0
        } else {
            (self.render_total.as_micros() / self.renders as u128) as u64
        };
        ProducerTelemetry {
            state,
            frames_produced: self.frames_produced,
            backpressure_stalls: self.backpressure_stalls,
            topup_pauses: self.topup_pauses,
            empty_renders: self.empty_renders,
            min_occupancy_frames: self.occupancy.min(),
            max_occupancy_frames: self.occupancy.max(),
            render_avg_us,
            render_max_us: self.render_max.as_micros() as u64,
            capacity_frames: capacity_frames as u64,
        }
    }
}

/// Puller-side counters. Updated from the real-time callback, so every method
/// here is arithmetic only.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ConsumerStats {
    pub underruns: u64,
    pub frames_consumed: u64,
    pub quanta: u64,
    pub occupancy_frames: u64,
    pub silent_quanta: u64,
    pub missed_quanta: u64,
    occupancy: OccupancyRange,
    drift_samples: u64,
    drift_total_us: u64,
    drift_max_us: u64,
}

impl ConsumerStats {
    #[inline]
    pub(crate) fn observe_occupancy(&mut self, frames: usize) {
        self.occupancy_frames = frames as u64;
        self.occupancy.observe(frames);
    }

    #[inline]
    pub(crate) fn record_drift(&mut self, drift_us: u64) {
        self.drift_samples += 1;
        self.drift_total_us = self.drift_total_us.saturating_add(drift_us);
        self.drift_max_us = self.drift_max_us.max(drift_us);
    }

    pub(crate) fn report(&self) -> ConsumerTelemetry {
        ConsumerTelemetry {
            underruns: self.underruns,
            frames_consumed: self.frames_consumed,
            quanta: self.quanta,
            min_occupancy_frames: self.occupancy.min(),
            max_occupancy_frames: self.occupancy.max(),
            occupancy_frames: self.occupancy_frames,
            silent_quanta: self.silent_quanta,
            missed_quanta: self.missed_quanta,
            drift_avg_us: self.drift_total_us.checked_div(self.drift_samples).unwrap_or(0),
            drift_max_us: self.drift_max_us,
        }
    }
}

/// Merges side reports into the session snapshot.
#[derive(Debug)]
pub struct TelemetryAggregator {
    snapshot: TelemetrySnapshot,
    degraded_underrun_threshold: u64,
    /// Generation of the current `play()`; reports from older runs are dropped.
    run: u64,
}

impl TelemetryAggregator {
    pub fn new(degraded_underrun_threshold: u64) -> Self {
        Self {
            snapshot: TelemetrySnapshot::default(),
            degraded_underrun_threshold: degraded_underrun_threshold.max(1),
            run: 0,
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.snapshot.state = state;
    }

    /// Describe the loaded session.
    pub fn set_session(
        &mut self,
        sample_rate: u32,
        channels: u16,
        block_frames: u32,
        subtrack: u32,
        duration_hint_ms: Option<u64>,
    ) {
        self.snapshot.sample_rate = Some(sample_rate);
        self.snapshot.channels = Some(channels);
        self.snapshot.block_frames = Some(block_frames);
        self.snapshot.subtrack = Some(subtrack);
        self.snapshot.duration_hint_ms = duration_hint_ms;
    }

    /// Reset counters for a new `play()` and return its generation.
    pub fn begin_run(&mut self) -> u64 {
        self.run += 1;
        self.reset_counters();
        self.run
    }

    fn is_stale(&self, run: u64, side: &'static str) -> bool {
        if run != self.run {
            tracing::debug!(run, current = self.run, side, "dropping stale telemetry");
            return true;
        }
        false
    }

    pub fn on_producer(&mut self, run: u64, report: ProducerTelemetry) {
        if self.is_stale(run, "producer") {
            return;
        }
        self.snapshot.producer = report;
    }

    /// Fold a puller report; flags degraded playback when underruns piled up since the last one.
    pub fn on_consumer(&mut self, run: u64, report: ConsumerTelemetry) {
        if self.is_stale(run, "consumer") {
            return;
        }
        let grew = report
            .underruns
            .saturating_sub(self.snapshot.consumer.underruns);
        if grew >= self.degraded_underrun_threshold && !self.snapshot.degraded {
            tracing::warn!(underruns = report.underruns, grew, "playback degraded");
            self.snapshot.degraded = true;
        }
        self.snapshot.consumer = report;
        self.snapshot.refresh_elapsed();
    }

    pub fn on_end(&mut self, reason: PlaybackEndReason, error: Option<String>) {
        self.snapshot.end_reason = Some(reason);
        if error.is_some() {
            self.snapshot.last_error = error;
        }
    }

    /// Counters restart with every start; session description and end reason survive.
    pub fn reset_counters(&mut self) {
        self.snapshot.producer = ProducerTelemetry::default();
        self.snapshot.consumer = ConsumerTelemetry::default();
        self.snapshot.degraded = false;
        self.snapshot.end_reason = None;
        self.snapshot.refresh_elapsed();
    }

    /// Forget the session entirely, keeping only the state and last error.
    pub fn clear_session(&mut self) {
        let state = self.snapshot.state;
        let end_reason = self.snapshot.end_reason;
        let last_error = self.snapshot.last_error.take();
        self.snapshot = TelemetrySnapshot {
            state,
            end_reason,
            last_error,
            ..TelemetrySnapshot::default()
        };
    }
}
