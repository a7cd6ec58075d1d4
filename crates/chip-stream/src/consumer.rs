//! Real-time puller.
//!
//! [`Consumer::process`] runs inside the host audio callback, once per quantum.
//! It never blocks, allocates or panics: every anomaly becomes a counter or
//! silence, and reports leave through a bounded channel with `try_send`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chip_stream_types::ConsumerTelemetry;
use crossbeam_channel::Sender;

use crate::config::StreamConfig;
use crate::ring::RingReader;
use crate::telemetry::ConsumerStats;

/// Flags the controller flips from outside the real-time context.
#[derive(Debug, Default)]
pub struct ConsumerControl {
    running: AtomicBool,
}

impl ConsumerControl {
    /// A new control starts not running.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Messages from the puller to the session monitor.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumerReport {
    /// Counters of the consumer installed by the `run`-th `play()`.
    Telemetry { run: u64, report: ConsumerTelemetry },
    /// The ring was marked finished and has been read empty.
    Drained,
}

pub struct Consumer {
    reader: RingReader,
    control: Arc<ConsumerControl>,
    reports: Sender<ConsumerReport>,
    block_frames: usize,
    nominal: Duration,
    stats: ConsumerStats,
    last_tick: Option<Instant>,
    report_interval: u64,
    silence_check_interval: u64,
    underrun_log_interval: u64,
    last_underrun_log: Option<u64>,
    drained: bool,
    /// `Drained` has not reached the monitor yet.
    drain_pending: bool,
    run: u64,
}

impl Consumer {
    pub fn new(
        reader: RingReader,
        sample_rate: u32,
        control: Arc<ConsumerControl>,
        reports: Sender<ConsumerReport>,
        config: &StreamConfig,
    ) -> Self {
        let block_frames = reader.ring().block_frames();
        let nominal = Duration::from_secs_f64(block_frames as f64 / sample_rate.max(1) as f64);
        Self {
            reader,
            control,
            reports,
            block_frames,
            nominal,
            stats: ConsumerStats::default(),
            last_tick: None,
            report_interval: config.consumer_telemetry_interval_quanta.max(1) as u64,
            silence_check_interval: config.silence_check_interval_quanta.max(1) as u64,
            underrun_log_interval: config.underrun_log_interval_quanta.max(1) as u64,
            last_underrun_log: None,
            drained: false,
            drain_pending: false,
            run: 0,
        }
    }

    /// Tag reports with the `play()` generation this consumer belongs to.
    pub fn with_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    pub fn channels(&self) -> usize {
        self.reader.ring().channels()
    }

    pub fn telemetry(&self) -> ConsumerTelemetry {
        self.stats.report()
    }

    /// Fill one quantum (`block_frames` samples per channel) in `outputs`.
    pub fn process<B: AsMut<[f32]>>(&mut self, now: Instant, outputs: &mut [B]) {
        if !self.control.is_running() {
            silence(outputs);
            self.last_tick = None;
            return;
        }

        self.track_drift(now);
        self.stats.quanta += 1;

        if self.drained {
            silence(outputs);
            if self.drain_pending {
                self.send_drained();
            }
            self.maybe_report();
            return;
        }

        let block = self.block_frames;
        let read = self.reader.read(outputs, block);
        let ring = self.reader.ring();
        let occupancy = ring.occupancy();
        self.stats.observe_occupancy(occupancy);

        if read == block {
            self.stats.frames_consumed += read as u64;
            if self.stats.quanta % self.silence_check_interval == 0 && is_silent(outputs) {
                self.stats.silent_quanta += 1;
            }
        } else if ring.is_finished() && occupancy == 0 {
            // End of stream: the tail was already zero-padded by `read`.
            self.stats.frames_consumed += read as u64;
            self.drained = true;
            self.send_drained();
            self.send_telemetry();
            return;
        } else {
            self.stats.underruns += 1;
            self.stats.silent_quanta += 1;
            silence(outputs);
            let quanta = self.stats.quanta;
            let due = self
                .last_underrun_log
                .is_none_or(|last| quanta - last >= self.underrun_log_interval);
            if due {
                self.last_underrun_log = Some(quanta);
                tracing::warn!(
                    underruns = self.stats.underruns,
                    read,
                    occupancy,
                    "underrun; emitting silence"
                );
            }
        }

        self.maybe_report();
    }

    fn track_drift(&mut self, now: Instant) {
        if let Some(prev) = self.last_tick {
            let delta = now.saturating_duration_since(prev);
            let drift = if delta > self.nominal {
                delta - self.nominal
            } else {
                self.nominal - delta
            };
            self.stats.record_drift(drift.as_micros() as u64);
            let nominal = self.nominal.as_secs_f64();
            if nominal > 0.0 && delta.as_secs_f64() > 1.5 * nominal {
                let periods = (delta.as_secs_f64() / nominal).round() as u64;
                self.stats.missed_quanta += periods.saturating_sub(1);
            }
        }
        self.last_tick = Some(now);
    }

    fn maybe_report(&mut self) {
        if self.stats.quanta % self.report_interval == 0 {
            self.send_telemetry();
        }
    }

    fn send_telemetry(&self) {
        let _ = self.reports.try_send(ConsumerReport::Telemetry {
            run: self.run,
            report: self.stats.report(),
        });
    }

    /// Retried on every later quantum until the channel has room.
    fn send_drained(&mut self) {
        self.drain_pending = self.reports.try_send(ConsumerReport::Drained).is_err();
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.send_telemetry();
    }
}

fn silence<B: AsMut<[f32]>>(outputs: &mut [B]) {
    for out in outputs.iter_mut() {
        out.as_mut().fill(0.0);
    }
}

fn is_silent<B: AsMut<[f32]>>(outputs: &mut [B]) -> bool {
    outputs
        .iter_mut()
        .all(|out| out.as_mut().iter().all(|&s| s == 0.0))
}
