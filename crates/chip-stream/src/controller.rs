//! Session facade.
//!
//! The controller owns the ring for the lifetime of a loaded track, spawns the
//! renderer thread against it, hands a [`Consumer`] to the host clock on every
//! `play()`, and runs a monitor thread that folds telemetry from both sides into
//! one [`TelemetrySnapshot`] and turns lifecycle messages into [`SessionEvent`]s.
//!
//! Faults reported by the renderer silence the consumer and shut the renderer
//! thread down straight away from the monitor thread; the clock is stopped and
//! the threads joined on the next controller call.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chip_stream_types::{PlaybackEndReason, SessionState, TelemetrySnapshot};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::clock::AudioClock;
use crate::config::StreamConfig;
use crate::consumer::{Consumer, ConsumerControl, ConsumerReport};
use crate::engine::{EngineFactory, EngineInfo};
use crate::error::StreamError;
use crate::producer::{ProducerCommand, ProducerEvent, ProducerHandle};
use crate::ring::{self, RingBuffer};
use crate::source::{PlaybackSession, SourceLoader};
use crate::telemetry::TelemetryAggregator;

/// Room for puller reports between two monitor wake-ups.
const CONSUMER_REPORT_CAPACITY: usize = 64;

/// Lifecycle notifications delivered to [`Controller::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Pre-roll complete.
    Ready,
    /// Engine exhausted and the ring drained.
    Ended,
    Error(StreamError),
}

/// Acknowledgments the monitor relays to a controller call that is waiting.
#[derive(Debug)]
enum Ack {
    Loaded(EngineInfo),
    Ready,
    Failed(StreamError),
}

fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Error, Error) => false,
        (_, Error) => true,
        (Idle | Ended | Error, Loading)
        | (Loading, Ready)
        | (Ready | Paused, Playing)
        | (Playing, Paused)
        | (Ready | Playing | Paused | Error, Ended) => true,
        _ => false,
    }
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "idle",
        SessionState::Loading => "loading",
        SessionState::Ready => "ready",
        SessionState::Playing => "playing",
        SessionState::Paused => "paused",
        SessionState::Ended => "ended",
        SessionState::Error => "in error",
    }
}

struct Shared {
    telemetry: TelemetryAggregator,
    subscribers: Vec<Sender<SessionEvent>>,
    /// Control of the consumer currently installed in the clock.
    control: Option<Arc<ConsumerControl>>,
}

impl Shared {
    fn broadcast(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn transition(&mut self, to: SessionState) -> bool {
        let from = self.telemetry.state();
        if !transition_allowed(from, to) {
            tracing::warn!(from = ?from, to = ?to, "session transition refused");
            return false;
        }
        tracing::info!(from = ?from, to = ?to, "session state");
        self.telemetry.set_state(to);
        self.broadcast(SessionEvent::StateChanged(to));
        true
    }

    /// Silence output and record the fault, once.
    fn fault(&mut self, err: &StreamError) {
        if let Some(control) = &self.control {
            control.set_running(false);
        }
        if self.telemetry.state() == SessionState::Error {
            return;
        }
        self.transition(SessionState::Error);
        self.telemetry
            .on_end(PlaybackEndReason::Error, Some(err.to_string()));
        self.broadcast(SessionEvent::Error(err.clone()));
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ActiveSession {
    ring: Arc<RingBuffer>,
    producer: ProducerHandle,
    monitor: Option<JoinHandle<()>>,
    acks: Receiver<Ack>,
    consumer_reports: Sender<ConsumerReport>,
    config: StreamConfig,
    sample_rate: u32,
}

pub struct Controller {
    config: StreamConfig,
    clock: Box<dyn AudioClock>,
    engine_factory: EngineFactory,
    loader: Box<dyn SourceLoader>,
    shared: Arc<Mutex<Shared>>,
    session: Option<ActiveSession>,
}

impl Controller {
    pub fn new(
        config: StreamConfig,
        clock: Box<dyn AudioClock>,
        engine_factory: EngineFactory,
        loader: Box<dyn SourceLoader>,
    ) -> Self {
        let shared = Shared {
            telemetry: TelemetryAggregator::new(config.degraded_underrun_threshold),
            subscribers: Vec::new(),
            control: None,
        };
        Self {
            config,
            clock,
            engine_factory,
            loader,
            shared: Arc::new(Mutex::new(shared)),
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).telemetry.state()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        lock(&self.shared).telemetry.snapshot()
    }

    /// Receive every session event from now on.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.shared).subscribers.push(tx);
        rx
    }

    /// Prepare `session` for playback: size the ring, start the renderer and
    /// wait for it to load the track.
    pub fn load(&mut self, session: PlaybackSession) -> Result<EngineInfo, StreamError> {
        self.reap();
        let state = self.state();
        if !matches!(
            state,
            SessionState::Idle | SessionState::Ended | SessionState::Error
        ) {
            return Err(StreamError::InvalidState {
                op: "load",
                state: state_name(state),
            });
        }
        lock(&self.shared).transition(SessionState::Loading);

        if !ring::shared_memory_supported() {
            return self.fail(StreamError::Initialization(
                "lock-free shared ring not supported on this target".into(),
            ));
        }
        if !self.clock.supports_realtime() {
            return self.fail(StreamError::Initialization(
                "output clock cannot run in real time".into(),
            ));
        }

        let format = self.clock.format();
        let mut config = self.config.clone();
        config.block_frames = format.block_frames;
        if let Err(e) = config.validate() {
            return self.fail(StreamError::Config(format!("{e:#}")));
        }
        let capacity = config.capacity_frames_for(format.sample_rate);

        let track = match self.loader.fetch(&session.source) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(StreamError::init(&e)),
        };
        let ring = match RingBuffer::new(capacity, format.channels as usize, format.block_frames)
        {
            Ok(ring) => ring,
            Err(e) => return self.fail(e),
        };

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (report_tx, report_rx) = crossbeam_channel::bounded(CONSUMER_REPORT_CAPACITY);
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();

        let producer = match ProducerHandle::spawn((self.engine_factory)(), config.clone(), event_tx)
        {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        let shared = self.shared.clone();
        let commands = producer.commands();
        let monitor = std::thread::Builder::new()
            .name("chip-session-monitor".into())
            .spawn(move || run_monitor(shared, commands, event_rx, report_rx, ack_tx));
        let monitor = match monitor {
            Ok(join) => join,
            Err(e) => {
                return self.fail(StreamError::Initialization(format!(
                    "spawn monitor thread: {e}"
                )));
            }
        };

        self.session = Some(ActiveSession {
            ring: ring.clone(),
            producer,
            monitor: Some(monitor),
            acks: ack_rx,
            consumer_reports: report_tx,
            config: config.clone(),
            sample_rate: format.sample_rate,
        });
        tracing::info!(
            source = %session.source.describe(),
            subtrack = session.subtrack,
            sample_rate = format.sample_rate,
            channels = format.channels,
            capacity_frames = capacity,
            "loading track"
        );

        if let Err(e) = self.send(ProducerCommand::Init {
            ring,
            sample_rate: format.sample_rate,
        }) {
            return self.fail(e);
        }
        if let Err(e) = self.send(ProducerCommand::Load {
            track,
            subtrack: session.subtrack,
            duration_hint_ms: session.duration_hint_ms,
        }) {
            return self.fail(e);
        }

        let info = match self.wait_for(config.control_timeout, "load acknowledgment", |ack| {
            matches!(ack, Ack::Loaded(_))
        }) {
            Ok(Ack::Loaded(info)) => info,
            Ok(other) => {
                return self.fail(StreamError::Initialization(format!(
                    "unexpected renderer ack {other:?}"
                )));
            }
            Err(e) => return self.fail(e),
        };

        let mut shared = lock(&self.shared);
        shared.telemetry.set_session(
            format.sample_rate,
            format.channels,
            format.block_frames as u32,
            session.subtrack,
            session.duration_hint_ms.or(info.duration_ms),
        );
        shared.transition(SessionState::Ready);
        Ok(info)
    }

    /// Start (or resume) output once the renderer has pre-rolled.
    pub fn play(&mut self) -> Result<(), StreamError> {
        self.reap();
        let state = self.state();
        match state {
            SessionState::Playing => return Ok(()),
            SessionState::Ready | SessionState::Paused => {}
            _ => {
                return Err(StreamError::InvalidState {
                    op: "play",
                    state: state_name(state),
                });
            }
        }
        let Some(session) = self.session.as_ref() else {
            return Err(StreamError::InvalidState {
                op: "play",
                state: "without a session",
            });
        };

        let Some(reader) = session.ring.reader() else {
            return self.fail(StreamError::Initialization(
                "ring reader already claimed".into(),
            ));
        };
        let control = ConsumerControl::new();
        // Reports still in flight from an earlier run carry the old generation.
        let run = {
            let mut shared = lock(&self.shared);
            shared.control = Some(control.clone());
            shared.telemetry.begin_run()
        };
        let consumer = Consumer::new(
            reader,
            session.sample_rate,
            control.clone(),
            session.consumer_reports.clone(),
            &session.config,
        )
        .with_run(run);
        let ready_timeout = session.config.ready_timeout;
        // Drop acknowledgments left over from an earlier start.
        for stale in session.acks.try_iter() {
            tracing::debug!(?stale, "discarding stale ack");
        }

        if let Err(e) = self.clock.start(consumer) {
            return self.fail(e);
        }
        if let Err(e) = self.send(ProducerCommand::Start { run }) {
            return self.fail(e);
        }
        if let Err(e) = self.wait_for(ready_timeout, "pre-roll", |ack| matches!(ack, Ack::Ready)) {
            return self.fail(e);
        }

        control.set_running(true);
        lock(&self.shared).transition(SessionState::Playing);
        Ok(())
    }

    /// Halt output but keep the ring and renderer. No-op unless playing.
    pub fn pause(&mut self) -> Result<(), StreamError> {
        self.reap();
        if self.state() != SessionState::Playing {
            return Ok(());
        }
        if let Err(e) = self.send(ProducerCommand::Stop) {
            return self.fail(e);
        }
        if let Some(control) = lock(&self.shared).control.take() {
            control.set_running(false);
        }
        self.clock.stop();
        lock(&self.shared).transition(SessionState::Paused);
        Ok(())
    }

    /// Tear the session down and end it. No-op once idle or ended.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        self.reap();
        let state = self.state();
        if matches!(state, SessionState::Idle | SessionState::Ended) && self.session.is_none() {
            return Ok(());
        }
        self.teardown();
        let mut shared = lock(&self.shared);
        shared.telemetry.clear_session();
        shared.transition(SessionState::Ended);
        shared.telemetry.on_end(PlaybackEndReason::Stopped, None);
        Ok(())
    }

    fn send(&self, cmd: ProducerCommand) -> Result<(), StreamError> {
        match self.session.as_ref() {
            Some(session) => session.producer.send(cmd),
            None => Err(StreamError::InvalidState {
                op: "send to renderer",
                state: "without a session",
            }),
        }
    }

    fn wait_for(
        &self,
        timeout: Duration,
        what: &'static str,
        wanted: impl Fn(&Ack) -> bool,
    ) -> Result<Ack, StreamError> {
        let Some(session) = self.session.as_ref() else {
            return Err(StreamError::InvalidState {
                op: "wait",
                state: "without a session",
            });
        };
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match session.acks.recv_timeout(left) {
                Ok(Ack::Failed(e)) => return Err(e),
                Ok(ack) if wanted(&ack) => return Ok(ack),
                Ok(other) => tracing::debug!(?other, what, "unexpected ack while waiting"),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(StreamError::Timeout {
                        what,
                        waited: timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StreamError::EngineFault("renderer exited".into()));
                }
            }
        }
    }

    /// Finish tearing down a session that ended or faulted behind our back.
    fn reap(&mut self) {
        if self.session.is_some()
            && matches!(self.state(), SessionState::Ended | SessionState::Error)
        {
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(control) = lock(&self.shared).control.take() {
            control.set_running(false);
        }
        self.clock.stop();
        session.producer.shutdown();
        if let Some(monitor) = session.monitor.take() {
            if monitor.join().is_err() {
                tracing::error!("session monitor panicked");
            }
        }
        tracing::debug!(ring = ?session.ring, "session torn down");
    }

    fn fail<T>(&mut self, err: StreamError) -> Result<T, StreamError> {
        tracing::error!("session failed: {err}");
        self.teardown();
        lock(&self.shared).fault(&err);
        Err(err)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Monitor thread body. Exits when the renderer thread is gone.
fn run_monitor(
    shared: Arc<Mutex<Shared>>,
    commands: Sender<ProducerCommand>,
    producer_events: Receiver<ProducerEvent>,
    consumer_reports: Receiver<ConsumerReport>,
    acks: Sender<Ack>,
) {
    loop {
        crossbeam_channel::select! {
            recv(producer_events) -> msg => match msg {
                Ok(event) => on_producer_event(&shared, &commands, &acks, event),
                Err(_) => break,
            },
            recv(consumer_reports) -> msg => match msg {
                Ok(report) => on_consumer_report(&shared, report),
                Err(_) => break,
            },
        }
    }
    for report in consumer_reports.try_iter() {
        on_consumer_report(&shared, report);
    }
    tracing::debug!("session monitor exiting");
}

fn on_producer_event(
    shared: &Mutex<Shared>,
    commands: &Sender<ProducerCommand>,
    acks: &Sender<Ack>,
    event: ProducerEvent,
) {
    match event {
        ProducerEvent::Loaded(info) => {
            let _ = acks.send(Ack::Loaded(info));
        }
        ProducerEvent::Ready => {
            lock(shared).broadcast(SessionEvent::Ready);
            let _ = acks.send(Ack::Ready);
        }
        ProducerEvent::Exhausted => tracing::debug!("renderer exhausted; waiting for drain"),
        ProducerEvent::Telemetry { run, report } => {
            lock(shared).telemetry.on_producer(run, report)
        }
        ProducerEvent::Error(err) => {
            tracing::error!("renderer reported: {err}");
            lock(shared).fault(&err);
            let _ = acks.send(Ack::Failed(err));
            // The renderer thread exits and the monitor follows once its events disconnect.
            let _ = commands.send(ProducerCommand::Stop);
            let _ = commands.send(ProducerCommand::Shutdown);
        }
    }
}

fn on_consumer_report(shared: &Mutex<Shared>, report: ConsumerReport) {
    let mut shared = lock(shared);
    match report {
        ConsumerReport::Telemetry { run, report } => shared.telemetry.on_consumer(run, report),
        ConsumerReport::Drained => {
            if shared.telemetry.state() == SessionState::Playing {
                shared.telemetry.on_end(PlaybackEndReason::Eof, None);
                shared.transition(SessionState::Ended);
                shared.broadcast(SessionEvent::Ended);
            } else {
                tracing::warn!(state = ?shared.telemetry.state(), "drain report outside playback");
            }
        }
    }
}
