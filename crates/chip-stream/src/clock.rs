//! Host clock seam.
//!
//! A clock owns the real-time context: once started it invokes
//! [`Consumer::process`] once per quantum until stopped. [`crate::output::CpalClock`]
//! drives a sound card; [`ManualClock`] is driven by hand.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::consumer::Consumer;
use crate::error::StreamError;

/// Shape of the quanta a clock requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockFormat {
    pub sample_rate: u32,
    /// Channels carried by the ring (the clock maps them to the device).
    pub channels: u16,
    pub block_frames: usize,
}

impl ClockFormat {
    /// Wall-clock duration of one quantum.
    pub fn quantum(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

pub trait AudioClock {
    fn format(&self) -> ClockFormat;

    /// Whether this clock can honor a fixed real-time cadence.
    fn supports_realtime(&self) -> bool {
        true
    }

    /// Begin invoking `consumer` once per quantum. Replaces any previous consumer.
    fn start(&mut self, consumer: Consumer) -> Result<(), StreamError>;

    /// Halt the cadence and drop the consumer. Idempotent.
    fn stop(&mut self);
}

struct ManualState {
    consumer: Option<Consumer>,
    outputs: Vec<Vec<f32>>,
    now: Instant,
}

/// A clock that only advances when [`ManualClockHandle::tick`] is called.
pub struct ManualClock {
    format: ClockFormat,
    realtime: bool,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(format: ClockFormat) -> Self {
        let outputs = vec![vec![0.0; format.block_frames]; format.channels as usize];
        Self {
            format,
            realtime: true,
            state: Arc::new(Mutex::new(ManualState {
                consumer: None,
                outputs,
                now: Instant::now(),
            })),
        }
    }

    /// Report no real-time capability, so sessions refuse to load on it.
    pub fn without_realtime(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn handle(&self) -> ManualClockHandle {
        ManualClockHandle {
            quantum: self.format.quantum(),
            state: self.state.clone(),
        }
    }
}

impl AudioClock for ManualClock {
    fn format(&self) -> ClockFormat {
        self.format
    }

    fn supports_realtime(&self) -> bool {
        self.realtime
    }

    fn start(&mut self, consumer: Consumer) -> Result<(), StreamError> {
        lock(&self.state).consumer = Some(consumer);
        Ok(())
    }

    fn stop(&mut self) {
        let consumer = lock(&self.state).consumer.take();
        drop(consumer);
    }
}

/// Drives a [`ManualClock`] from another thread.
#[derive(Clone)]
pub struct ManualClockHandle {
    quantum: Duration,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClockHandle {
    pub fn is_running(&self) -> bool {
        lock(&self.state).consumer.is_some()
    }

    /// Run one quantum exactly one nominal period after the last one.
    ///
    /// Returns the planar output, or `None` while the clock is stopped.
    pub fn tick(&self) -> Option<Vec<Vec<f32>>> {
        self.tick_after(self.quantum)
    }

    /// Run one quantum `elapsed` after the previous one.
    pub fn tick_after(&self, elapsed: Duration) -> Option<Vec<Vec<f32>>> {
        let mut guard = lock(&self.state);
        let st = &mut *guard;
        st.now += elapsed;
        let consumer = st.consumer.as_mut()?;
        consumer.process(st.now, &mut st.outputs);
        Some(st.outputs.clone())
    }
}

fn lock(state: &Mutex<ManualState>) -> MutexGuard<'_, ManualState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::consumer::ConsumerControl;
    use crate::ring::RingBuffer;

    fn format() -> ClockFormat {
        ClockFormat {
            sample_rate: 48_000,
            channels: 2,
            block_frames: 64,
        }
    }

    #[test]
    fn quantum_matches_block_and_rate() {
        assert_eq!(format().quantum().as_micros(), 1_333);
    }

    #[test]
    fn tick_without_consumer_is_none() {
        let clock = ManualClock::new(format());
        assert!(clock.handle().tick().is_none());
        assert!(!clock.handle().is_running());
    }

    #[test]
    fn tick_runs_the_consumer() {
        let ring = RingBuffer::new(256, 2, 64).unwrap();
        let mut w = ring.writer().unwrap();
        w.write(&[0.5f32; 128 * 2]);

        let control = ConsumerControl::new();
        control.set_running(true);
        let (tx, _rx) = crossbeam_channel::bounded(8);
        let consumer = Consumer::new(
            ring.reader().unwrap(),
            48_000,
            control,
            tx,
            &StreamConfig::default(),
        );

        let mut clock = ManualClock::new(format());
        let handle = clock.handle();
        clock.start(consumer).unwrap();
        assert!(handle.is_running());
        let out = handle.tick().unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|ch| ch.iter().all(|&s| s == 0.5)));
        assert_eq!(ring.occupancy(), 64);

        clock.stop();
        clock.stop();
        assert!(handle.tick().is_none());
        // Dropping the consumer released the reader claim.
        assert!(ring.reader().is_some());
    }

    #[test]
    fn without_realtime_is_reported() {
        assert!(!ManualClock::new(format()).without_realtime().supports_realtime());
    }
}
