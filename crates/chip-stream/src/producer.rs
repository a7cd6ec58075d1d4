//! Renderer driver.
//!
//! Owns the synthesis engine and the ring's writer handle on a background thread.
//! Commands arrive over a channel; lifecycle events and telemetry go back over another.
//!
//! ## Fill policy
//! Both pre-roll and streaming aim at the same target occupancy
//! (`pre_roll_frames`). Each step renders at most one chunk, converts it to the
//! ring format and writes whole blocks only, carrying any remainder to the next
//! step. A full ring is either a top-up pause (occupancy at/above the
//! high-watermark) or a backpressure stall; both yield and retry.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chip_stream_types::{ProducerState, ProducerTelemetry};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::config::StreamConfig;
use crate::engine::{EngineInfo, SynthEngine};
use crate::error::StreamError;
use crate::ring::{RingBuffer, RingWriter};
use crate::strategy::BufferingStrategy;
use crate::telemetry::ProducerStats;

/// Control messages accepted by the renderer thread.
#[derive(Debug)]
pub enum ProducerCommand {
    Init {
        ring: Arc<RingBuffer>,
        sample_rate: u32,
    },
    Load {
        track: Vec<u8>,
        subtrack: u32,
        duration_hint_ms: Option<u64>,
    },
    /// Begin pre-roll; telemetry from here on is tagged with `run`.
    Start { run: u64 },
    /// Halt streaming; safe to send repeatedly.
    Stop,
    /// Exit the thread, releasing the writer handle.
    Shutdown,
}

/// Messages from the renderer thread.
#[derive(Clone, Debug, PartialEq)]
pub enum ProducerEvent {
    /// Acknowledges `Load`.
    Loaded(EngineInfo),
    /// Pre-roll finished; sent once per `Start`.
    Ready,
    /// Engine ran out of input and every frame reached the ring.
    Exhausted,
    Telemetry { run: u64, report: ProducerTelemetry },
    Error(StreamError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Work was done; go again.
    Progress,
    /// No room; wait a little.
    Yield,
    /// Target occupancy reached; wait a little.
    Satisfied,
    /// Nothing left to do until the next command.
    Idle,
}

fn transition_allowed(from: ProducerState, to: ProducerState) -> bool {
    use ProducerState::*;
    match (from, to) {
        (Error, _) => false,
        (_, Error) => true,
        (Uninitialized, Initializing)
        | (Stopped, Initializing)
        | (Initializing, PreRolling)
        | (Stopped, PreRolling)
        | (PreRolling, Streaming)
        | (PreRolling, Stopped)
        | (Streaming, Stopped) => true,
        _ => false,
    }
}

pub struct Producer {
    state: ProducerState,
    engine: Box<dyn SynthEngine>,
    config: StreamConfig,
    events: Sender<ProducerEvent>,
    writer: Option<RingWriter>,
    sample_rate: u32,
    channels: usize,
    engine_channels: usize,
    strategy: Option<BufferingStrategy>,
    /// Ring-format samples not yet written (less than a block in steady state).
    pending: Vec<f32>,
    stats: ProducerStats,
    empty_streak: u32,
    exhausted: bool,
    ready_sent: bool,
    last_report: Instant,
    run: u64,
}

impl Producer {
    pub fn new(
        engine: Box<dyn SynthEngine>,
        config: StreamConfig,
        events: Sender<ProducerEvent>,
    ) -> Self {
        Self {
            state: ProducerState::Uninitialized,
            engine,
            config,
            events,
            writer: None,
            sample_rate: 0,
            channels: 0,
            engine_channels: 0,
            strategy: None,
            pending: Vec::new(),
            stats: ProducerStats::default(),
            empty_streak: 0,
            exhausted: false,
            ready_sent: false,
            last_report: Instant::now(),
            run: 0,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn strategy(&self) -> Option<BufferingStrategy> {
        self.strategy
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ProducerState::PreRolling | ProducerState::Streaming
        )
    }

    fn transition(&mut self, to: ProducerState) -> bool {
        if !transition_allowed(self.state, to) {
            tracing::warn!(from = ?self.state, to = ?to, "renderer transition refused");
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?to, "renderer state");
        self.state = to;
        true
    }

    fn emit(&self, event: ProducerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("renderer event dropped; controller gone");
        }
    }

    /// Apply one command. Returns `false` when the thread should exit.
    pub fn handle(&mut self, cmd: ProducerCommand) -> bool {
        match cmd {
            ProducerCommand::Init { ring, sample_rate } => {
                if let Err(e) = self.init(ring, sample_rate) {
                    self.fault(e);
                }
            }
            ProducerCommand::Load {
                track,
                subtrack,
                duration_hint_ms,
            } => match self.load(&track, subtrack, duration_hint_ms) {
                Ok(info) => self.emit(ProducerEvent::Loaded(info)),
                Err(e) => self.fault(e),
            },
            ProducerCommand::Start { run } => self.start(run),
            ProducerCommand::Stop => self.stop(),
            ProducerCommand::Shutdown => {
                self.stop();
                self.writer = None;
                return false;
            }
        }
        true
    }

    fn init(&mut self, ring: Arc<RingBuffer>, sample_rate: u32) -> Result<(), StreamError> {
        if self.state != ProducerState::Uninitialized {
            tracing::warn!(state = ?self.state, "init ignored");
            return Ok(());
        }
        if sample_rate == 0 {
            return Err(StreamError::Initialization("sample rate must be > 0".into()));
        }
        let writer = ring
            .writer()
            .ok_or_else(|| StreamError::Initialization("ring writer already claimed".into()))?;
        self.channels = ring.channels();
        self.sample_rate = sample_rate;
        self.writer = Some(writer);
        self.transition(ProducerState::Initializing);
        Ok(())
    }

    fn load(
        &mut self,
        track: &[u8],
        subtrack: u32,
        duration_hint_ms: Option<u64>,
    ) -> Result<EngineInfo, StreamError> {
        if self.state == ProducerState::Stopped {
            self.transition(ProducerState::Initializing);
        }
        if self.state != ProducerState::Initializing {
            return Err(StreamError::InvalidState {
                op: "load",
                state: "not initialized",
            });
        }
        let ring = match self.writer.as_ref() {
            Some(w) => w.ring().clone(),
            None => return Err(StreamError::Initialization("no ring".into())),
        };

        let strategy = BufferingStrategy::derive(
            ring.capacity_frames(),
            ring.block_frames(),
            &self.config.strategy,
        );
        let info = self
            .engine
            .load(track, subtrack, self.sample_rate)
            .map_err(|e| StreamError::init(&e))?;
        if info.channels == 0 {
            return Err(StreamError::Initialization(format!(
                "{} engine reported zero channels",
                self.engine.name()
            )));
        }

        self.engine_channels = info.channels as usize;
        self.strategy = Some(strategy);
        self.pending.clear();
        self.exhausted = false;
        tracing::info!(
            engine = self.engine.name(),
            subtrack,
            duration_hint_ms = ?duration_hint_ms.or(info.duration_ms),
            capacity_frames = strategy.capacity_frames,
            pre_roll_frames = strategy.pre_roll_frames,
            render_chunk_frames = strategy.render_chunk_frames,
            cycles_per_chunk = strategy.render_cycles_per_chunk,
            "track loaded"
        );
        Ok(info)
    }

    fn start(&mut self, run: u64) {
        if self.is_active() {
            tracing::debug!("start ignored; already running");
            return;
        }
        if self.strategy.is_none() {
            tracing::warn!(state = ?self.state, "start ignored; nothing loaded");
            return;
        }
        if !self.transition(ProducerState::PreRolling) {
            return;
        }
        self.run = run;
        self.stats = ProducerStats::default();
        self.empty_streak = 0;
        self.ready_sent = false;
        self.last_report = Instant::now();
    }

    fn stop(&mut self) {
        if !self.is_active() {
            return;
        }
        self.transition(ProducerState::Stopped);
        self.report();
    }

    fn fault(&mut self, err: StreamError) {
        tracing::error!(state = ?self.state, "renderer fault: {err}");
        self.transition(ProducerState::Error);
        self.emit(ProducerEvent::Error(err));
        self.report();
    }

    fn report(&mut self) {
        let capacity = self.strategy.map(|s| s.capacity_frames).unwrap_or(0);
        self.emit(ProducerEvent::Telemetry {
            run: self.run,
            report: self.stats.report(self.state, capacity),
        });
        self.last_report = Instant::now();
    }

    fn signal_ready(&mut self) {
        if self.ready_sent {
            return;
        }
        self.ready_sent = true;
        let occupancy = self.writer.as_ref().map(|w| w.ring().occupancy()).unwrap_or(0);
        tracing::info!(occupancy, exhausted = self.exhausted, "pre-roll complete");
        self.emit(ProducerEvent::Ready);
        self.transition(ProducerState::Streaming);
    }

    /// One unit of work while pre-rolling or streaming.
    pub(crate) fn step(&mut self) -> Step {
        if !self.is_active() {
            return Step::Idle;
        }
        if self.state == ProducerState::PreRolling && self.exhausted {
            self.signal_ready();
        }

        let step = match self.fill_step() {
            Ok(step) => step,
            Err(e) => {
                self.fault(e);
                return Step::Idle;
            }
        };

        if self.state == ProducerState::PreRolling {
            let pre_roll = self.strategy.map(|s| s.pre_roll_frames).unwrap_or(0);
            let occupancy = self.writer.as_ref().map(|w| w.ring().occupancy()).unwrap_or(0);
            if occupancy >= pre_roll || self.exhausted {
                self.signal_ready();
            }
        }

        if self.is_active()
            && self.last_report.elapsed() >= self.config.producer_telemetry_interval
        {
            self.report();
        }
        step
    }

    fn fill_step(&mut self) -> Result<Step, StreamError> {
        let (Some(strategy), Some(writer)) = (self.strategy, self.writer.as_ref()) else {
            return Ok(Step::Idle);
        };
        let ring = writer.ring();
        let occupancy = ring.occupancy();
        let available = ring.available_write();
        let finished = ring.is_finished();
        self.stats.observe_occupancy(occupancy);

        let ch = self.channels;
        let block = strategy.block_frames;

        if self.exhausted {
            if finished {
                self.transition(ProducerState::Stopped);
                return Ok(Step::Idle);
            }
            let rem = (self.pending.len() / ch) % block;
            if rem != 0 {
                self.pending.resize(self.pending.len() + (block - rem) * ch, 0.0);
            }
            self.write_aligned(block);
            if self.pending.is_empty() {
                self.finish();
                return Ok(Step::Idle);
            }
            return Ok(Step::Yield);
        }

        if available < block {
            if occupancy >= strategy.high_watermark_frames {
                self.stats.topup_pauses += 1;
            } else {
                self.stats.backpressure_stalls += 1;
                tracing::debug!(occupancy, available, "backpressure stall");
            }
            return Ok(Step::Yield);
        }

        let pending_frames = self.pending.len() / ch;
        if pending_frames >= block {
            self.write_aligned(block);
            return Ok(Step::Progress);
        }

        let deficit = strategy.pre_roll_frames.saturating_sub(occupancy);
        if deficit == 0 {
            return Ok(Step::Satisfied);
        }
        let frames = strategy.next_request(deficit, available.saturating_sub(pending_frames));
        if frames == 0 {
            return Ok(Step::Yield);
        }

        let started = Instant::now();
        let before = self.pending.len();
        let pcm = self
            .engine
            .render(frames, strategy.cycles_for(frames))
            .map_err(|e| StreamError::engine(&e))?;
        pcm.append_normalized(self.engine_channels, ch, &mut self.pending);
        self.stats.record_render(started.elapsed());
        let rendered = (self.pending.len() - before) / ch;

        if rendered == 0 {
            if self.engine.has_more_input() {
                self.empty_streak += 1;
                self.stats.empty_renders += 1;
                if self.empty_streak >= self.config.max_empty_renders.max(1) {
                    return Err(StreamError::EngineFault(format!(
                        "{} engine rendered nothing {} times in a row",
                        self.engine.name(),
                        self.empty_streak
                    )));
                }
            } else {
                self.exhausted = true;
            }
            return Ok(Step::Progress);
        }

        self.empty_streak = 0;
        if !self.engine.has_more_input() {
            self.exhausted = true;
        }
        self.write_aligned(block);
        Ok(Step::Progress)
    }

    /// Write every whole block held in `pending`.
    fn write_aligned(&mut self, block: usize) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let ch = self.channels;
        let aligned = (self.pending.len() / ch) / block * block;
        if aligned == 0 {
            return;
        }
        let written = writer.write(&self.pending[..aligned * ch]);
        if written < aligned {
            tracing::debug!(offered = aligned, written, "short ring write; carrying remainder");
        }
        self.pending.drain(..written * ch);
        self.stats.frames_produced += written as u64;
    }

    fn finish(&mut self) {
        if let Some(writer) = self.writer.as_ref() {
            writer.ring().mark_finished();
        }
        tracing::info!(frames_produced = self.stats.frames_produced, "engine exhausted");
        self.emit(ProducerEvent::Exhausted);
        self.transition(ProducerState::Stopped);
        self.report();
    }

    fn yield_interval(&self) -> Duration {
        let block = self.strategy.map(|s| s.block_frames).unwrap_or(128);
        let quantum = block as f64 / self.sample_rate.max(1) as f64;
        Duration::from_secs_f64(quantum / 2.0).max(Duration::from_micros(250))
    }

    /// Thread body: block on commands while idle, interleave them with work while active.
    pub fn run(mut self, commands: Receiver<ProducerCommand>) {
        let mut wait: Option<Duration> = None;
        loop {
            let cmd = if self.is_active() {
                match wait.take() {
                    Some(d) => match commands.recv_timeout(d) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => match commands.try_recv() {
                        Ok(cmd) => Some(cmd),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => break,
                    },
                }
            } else {
                match commands.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            };

            if let Some(cmd) = cmd {
                if !self.handle(cmd) {
                    break;
                }
                continue;
            }

            match self.step() {
                Step::Yield | Step::Satisfied => wait = Some(self.yield_interval()),
                Step::Progress | Step::Idle => {}
            }
        }
        tracing::debug!("renderer thread exiting");
    }
}

/// Owner of the renderer thread.
pub struct ProducerHandle {
    commands: Sender<ProducerCommand>,
    join: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    pub fn spawn(
        engine: Box<dyn SynthEngine>,
        config: StreamConfig,
        events: Sender<ProducerEvent>,
    ) -> Result<Self, StreamError> {
        let (commands, rx) = crossbeam_channel::unbounded();
        let producer = Producer::new(engine, config, events);
        let join = std::thread::Builder::new()
            .name("chip-renderer".into())
            .spawn(move || producer.run(rx))
            .map_err(|e| StreamError::Initialization(format!("spawn renderer thread: {e}")))?;
        Ok(Self {
            commands,
            join: Some(join),
        })
    }

    pub fn send(&self, cmd: ProducerCommand) -> Result<(), StreamError> {
        self.commands
            .send(cmd)
            .map_err(|_| StreamError::EngineFault("renderer thread exited".into()))
    }

    /// A second command sender, for threads that may need to stop the renderer.
    pub(crate) fn commands(&self) -> Sender<ProducerCommand> {
        self.commands.clone()
    }

    /// Stop streaming, exit the thread and wait for it.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(ProducerCommand::Stop);
        let _ = self.commands.send(ProducerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("renderer thread panicked");
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::engine::scripted::ScriptedEngine;
    use crate::engine::{PulseEngine, PulseSong};

    struct Rig {
        producer: Producer,
        ring: Arc<RingBuffer>,
        events: Receiver<ProducerEvent>,
    }

    impl Rig {
        fn new(engine: ScriptedEngine, capacity: usize, block: usize, config: StreamConfig) -> Self {
            let ring = RingBuffer::new(capacity, 2, block).unwrap();
            Self::with_ring(engine, ring, config)
        }

        fn with_ring(engine: ScriptedEngine, ring: Arc<RingBuffer>, config: StreamConfig) -> Self {
            let (tx, rx) = crossbeam_channel::unbounded();
            let mut producer = Producer::new(Box::new(engine), config, tx);
            assert!(producer.handle(ProducerCommand::Init {
                ring: ring.clone(),
                sample_rate: 44_100,
            }));
            producer.handle(ProducerCommand::Load {
                track: Vec::new(),
                subtrack: 0,
                duration_hint_ms: None,
            });
            Self {
                producer,
                ring,
                events: rx,
            }
        }

        fn run_until(&mut self, done: impl Fn(&Producer) -> bool, max_steps: usize) -> usize {
            for i in 0..max_steps {
                if done(&self.producer) {
                    return i;
                }
                self.producer.step();
            }
            panic!("condition not reached in {max_steps} steps");
        }

        fn events(&self) -> Vec<ProducerEvent> {
            self.events.try_iter().collect()
        }
    }

    fn count(events: &[ProducerEvent], pred: impl Fn(&ProducerEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn transition_table_refuses_skips() {
        use ProducerState::*;
        assert!(transition_allowed(Uninitialized, Initializing));
        assert!(transition_allowed(Streaming, Error));
        assert!(!transition_allowed(Uninitialized, Streaming));
        assert!(!transition_allowed(Error, PreRolling));
        assert!(!transition_allowed(Stopped, Streaming));
    }

    #[test]
    fn load_acknowledges_with_engine_info() {
        let rig = Rig::new(ScriptedEngine::endless(), 4096, 128, StreamConfig::default());
        assert_eq!(rig.producer.state(), ProducerState::Initializing);
        let events = rig.events();
        assert!(matches!(&events[0], ProducerEvent::Loaded(info) if info.channels == 2));
        assert_eq!(rig.producer.strategy().map(|s| s.pre_roll_frames), Some(1_280));
    }

    #[test]
    fn pre_roll_reaches_target_and_signals_ready_once() {
        let mut rig = Rig::new(ScriptedEngine::endless(), 16_384, 128, StreamConfig::default());
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.run_until(|p| p.state() == ProducerState::Streaming, 100);
        assert!(rig.ring.occupancy() >= 4_992);
        // Target reached: further steps only wait.
        for _ in 0..10 {
            assert_eq!(rig.producer.step(), Step::Satisfied);
        }
        let events = rig.events();
        assert_eq!(count(&events, |e| *e == ProducerEvent::Ready), 1);
        assert_eq!(rig.ring.occupancy() % 128, 0);
    }

    #[test]
    fn streaming_tops_up_after_reads() {
        let mut rig = Rig::new(ScriptedEngine::endless(), 16_384, 128, StreamConfig::default());
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.run_until(|p| p.state() == ProducerState::Streaming, 100);

        let mut reader = rig.ring.reader().unwrap();
        let mut out = vec![vec![0.0f32; 1_000]; 2];
        reader.read(&mut out, 1_000);
        assert!(rig.ring.occupancy() < 4_992);
        let ring = rig.ring.clone();
        rig.run_until(|_| ring.occupancy() >= 4_992, 10);
        assert_eq!(rig.producer.stats.frames_produced, 4_992 + 1_024);
    }

    #[test]
    fn fifty_empty_renders_is_an_engine_fault() {
        let mut rig = Rig::new(
            ScriptedEngine::stalling_after(0),
            16_384,
            128,
            StreamConfig::default(),
        );
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        for _ in 0..49 {
            rig.producer.step();
        }
        assert_eq!(rig.producer.state(), ProducerState::PreRolling);
        rig.producer.step();
        assert_eq!(rig.producer.state(), ProducerState::Error);

        let events = rig.events();
        assert_eq!(
            count(&events, |e| matches!(e, ProducerEvent::Error(StreamError::EngineFault(_)))),
            1
        );
        let empty = events.iter().rev().find_map(|e| match e {
            ProducerEvent::Telemetry { report, .. } => Some(report.empty_renders),
            _ => None,
        });
        assert_eq!(empty, Some(50));
        assert_eq!(count(&events, |e| *e == ProducerEvent::Ready), 0);
        assert_eq!(rig.producer.step(), Step::Idle);
    }

    #[test]
    fn full_ring_below_watermark_counts_one_stall() {
        let ring = RingBuffer::new(1_024, 2, 128).unwrap();
        let pattern: Vec<f32> = (0..2_048).map(|i| i as f32).collect();
        assert_eq!(ring.writer().unwrap().write(&pattern), 1_024);

        let config = StreamConfig {
            strategy: StrategyConfig {
                high_watermark_ratio: 4.0,
                ..StrategyConfig::default()
            },
            ..StreamConfig::default()
        };
        let mut rig = Rig::with_ring(ScriptedEngine::endless(), ring, config);
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        assert_eq!(rig.producer.step(), Step::Yield);
        assert_eq!(rig.producer.stats.backpressure_stalls, 1);
        assert_eq!(rig.producer.stats.topup_pauses, 0);

        let mut reader = rig.ring.reader().unwrap();
        let mut out = vec![vec![0.0f32; 1_024]; 2];
        assert_eq!(reader.read(&mut out, 1_024), 1_024);
        assert_eq!(out[0][5], 10.0);
        assert_eq!(out[1][1_023], 2_047.0);
    }

    #[test]
    fn full_ring_at_target_is_a_topup_pause() {
        let ring = RingBuffer::new(1_024, 2, 128).unwrap();
        ring.writer().unwrap().write(&vec![0.1f32; 2_048]);
        let mut rig = Rig::with_ring(ScriptedEngine::endless(), ring, StreamConfig::default());
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.producer.step();
        assert_eq!(rig.producer.stats.backpressure_stalls, 0);
        assert_eq!(rig.producer.stats.topup_pauses, 1);
        assert_eq!(rig.producer.state(), ProducerState::Streaming);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut rig = Rig::new(ScriptedEngine::endless(), 4_096, 128, StreamConfig::default());
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.run_until(|p| p.state() == ProducerState::Streaming, 100);
        rig.producer.handle(ProducerCommand::Stop);
        rig.producer.handle(ProducerCommand::Stop);
        assert_eq!(rig.producer.state(), ProducerState::Stopped);
        assert_eq!(rig.producer.step(), Step::Idle);
        let events = rig.events();
        assert_eq!(count(&events, |e| matches!(e, ProducerEvent::Error(_))), 0);

        // Restart re-announces readiness.
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.run_until(|p| p.state() == ProducerState::Streaming, 100);
        assert_eq!(count(&rig.events(), |e| *e == ProducerEvent::Ready), 1);
    }

    #[test]
    fn end_of_stream_pads_final_block_and_marks_finished() {
        let mut rig = Rig::new(ScriptedEngine::finite(1_000), 4_096, 128, StreamConfig::default());
        rig.producer.handle(ProducerCommand::Start { run: 1 });
        rig.run_until(|p| p.state() == ProducerState::Stopped, 100);
        assert!(rig.ring.is_finished());
        assert_eq!(rig.ring.occupancy(), 1_024);

        let events = rig.events();
        let ready = events.iter().position(|e| *e == ProducerEvent::Ready);
        let exhausted = events.iter().position(|e| *e == ProducerEvent::Exhausted);
        assert!(ready.is_some() && exhausted.is_some());
        assert!(ready < exhausted);

        let mut reader = rig.ring.reader().unwrap();
        let mut out = vec![vec![1.0f32; 1_024]; 2];
        reader.read(&mut out, 1_024);
        assert_eq!(out[0][999], 0.25);
        assert_eq!(out[0][1_000], 0.0);
    }

    #[test]
    fn load_failure_is_an_initialization_error() {
        let engine = ScriptedEngine::failing_load();
        let rig = Rig::new(engine, 4_096, 128, StreamConfig::default());
        assert_eq!(rig.producer.state(), ProducerState::Error);
        let events = rig.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProducerEvent::Error(StreamError::Initialization(_)))));
    }

    #[test]
    fn second_writer_cannot_init() {
        let ring = RingBuffer::new(1_024, 2, 128).unwrap();
        let _held = ring.writer().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut producer = Producer::new(Box::new(ScriptedEngine::endless()), StreamConfig::default(), tx);
        producer.handle(ProducerCommand::Init {
            ring,
            sample_rate: 48_000,
        });
        assert_eq!(producer.state(), ProducerState::Error);
        assert!(rx.try_iter().any(|e| matches!(e, ProducerEvent::Error(_))));
    }

    #[test]
    fn threaded_renderer_pre_rolls_a_pulse_song() {
        let ring = RingBuffer::new(8_192, 2, 128).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handle =
            ProducerHandle::spawn(Box::new(PulseEngine::new()), StreamConfig::default(), tx).unwrap();
        handle
            .send(ProducerCommand::Init {
                ring: ring.clone(),
                sample_rate: 44_100,
            })
            .unwrap();
        handle
            .send(ProducerCommand::Load {
                track: PulseSong::demo().to_bytes(),
                subtrack: 0,
                duration_hint_ms: None,
            })
            .unwrap();
        handle.send(ProducerCommand::Start { run: 1 }).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ready = false;
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ProducerEvent::Ready) => {
                    ready = true;
                    break;
                }
                Ok(ProducerEvent::Error(e)) => panic!("renderer failed: {e}"),
                _ => {}
            }
        }
        assert!(ready);
        assert!(ring.occupancy() >= 2_048);

        handle.shutdown();
        handle.shutdown();
        assert!(handle.send(ProducerCommand::Start { run: 1 }).is_err());
        // Writer claim released on exit.
        assert!(ring.writer().is_some());
    }

    #[test]
    fn threaded_stop_halts_rendering_within_a_chunk() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let config = StreamConfig::default();
        let ring = RingBuffer::new(8_192, 2, 128).unwrap();
        let chunk_frames = BufferingStrategy::derive(8_192, 128, &config.strategy).render_chunk_frames;
        let chunk = Duration::from_secs_f64(chunk_frames as f64 / 44_100.0);

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handle =
            ProducerHandle::spawn(Box::new(ScriptedEngine::endless()), config, tx).unwrap();
        handle
            .send(ProducerCommand::Init {
                ring: ring.clone(),
                sample_rate: 44_100,
            })
            .unwrap();
        handle
            .send(ProducerCommand::Load {
                track: Vec::new(),
                subtrack: 0,
                duration_hint_ms: None,
            })
            .unwrap();
        handle.send(ProducerCommand::Start { run: 7 }).unwrap();
        assert!(matches!(
            rx.iter().find(|e| matches!(e, ProducerEvent::Ready | ProducerEvent::Error(_))),
            Some(ProducerEvent::Ready)
        ));

        // Keep the renderer busy by draining the ring as fast as it fills.
        let draining = Arc::new(AtomicBool::new(true));
        let drain = {
            let mut reader = ring.reader().unwrap();
            let draining = draining.clone();
            std::thread::spawn(move || {
                let mut out = vec![vec![0.0f32; 128]; 2];
                while draining.load(Ordering::Relaxed) {
                    if reader.read(&mut out, 128) == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };
        std::thread::sleep(chunk * 2);

        let sent = Instant::now();
        handle.send(ProducerCommand::Stop).unwrap();
        let stopped = rx.iter().find_map(|e| match e {
            ProducerEvent::Telemetry { run, report } if report.state == ProducerState::Stopped => {
                Some((run, report))
            }
            _ => None,
        });
        let halted_after = sent.elapsed();
        draining.store(false, Ordering::Relaxed);
        drain.join().unwrap();

        let (run, report) = stopped.unwrap();
        assert_eq!(run, 7);
        assert!(
            halted_after < chunk + Duration::from_millis(50),
            "stop took {halted_after:?}, chunk is {chunk:?}"
        );

        // Nothing reaches the ring once stopped.
        let occupancy = ring.occupancy();
        std::thread::sleep(chunk * 3);
        assert_eq!(ring.occupancy(), occupancy);
        assert!(report.frames_produced > 0);

        handle.shutdown();
    }
}
