//! chip-play: stream a chip tune (or any decodable file) to an output device.
//!
//! The renderer thread keeps a lock-free ring topped up while the sound card
//! callback pulls fixed quanta out of it. Telemetry snapshots are printed as
//! JSON lines until the track ends or Ctrl-C is pressed.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chip_stream::config::StreamConfig;
use chip_stream::device;
use chip_stream::engine::EngineKind;
use chip_stream::output::CpalClock;
use chip_stream::source::{FsLoader, PlaybackSession, SourceLoader, TrackSource};
use chip_stream::{Controller, SessionEvent};
use chip_stream_types::TelemetrySnapshot;
use clap::Parser;
use cpal::traits::DeviceTrait;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

const EVENT_POLL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chip_stream=info")),
        )
        .init();
    let host = cpal::default_host();

    if args.list_devices {
        device::list_devices(&host)?;
        return Ok(());
    }
    let path = args
        .path
        .clone()
        .context("a track path is required")?;

    let config = stream_config(&args)?;
    let device_name = normalize_device_name(args.device.clone());
    let device = device::pick_device(&host, device_name.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");
    let clock = CpalClock::open(device, args.rate, config.block_frames)?;

    let bytes = FsLoader.fetch(&TrackSource::Path(path.clone()))?;
    let kind = engine_kind(args.engine, &bytes);
    tracing::info!(path = %path.display(), engine = ?kind, subtrack = args.subtrack, "track");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let _ = ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst));
    }

    let mut controller = Controller::new(config, Box::new(clock), kind.factory(), Box::new(FsLoader));
    let events = controller.subscribe();
    let session = PlaybackSession::new(TrackSource::Bytes(bytes)).with_subtrack(args.subtrack);
    let info = controller.load(session)?;
    tracing::info!(
        channels = info.channels,
        subtracks = info.subtracks,
        duration_ms = ?info.duration_ms,
        title = ?info.title,
        "track loaded"
    );
    controller.play()?;

    let every = telemetry_interval(args.telemetry_secs)?;
    let outcome = watch(&controller, &events, &interrupted, every);
    controller.stop()?;
    print_snapshot(&controller.snapshot())?;
    outcome
}

/// Block until the session ends, fails or the user interrupts, printing telemetry along the way.
fn watch(
    controller: &Controller,
    events: &Receiver<SessionEvent>,
    interrupted: &AtomicBool,
    every: Duration,
) -> Result<()> {
    let mut next_report = Instant::now() + every;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            tracing::info!("interrupted");
            return Ok(());
        }
        match events.recv_timeout(EVENT_POLL) {
            Ok(SessionEvent::Ended) => {
                tracing::info!("playback finished");
                return Ok(());
            }
            Ok(SessionEvent::Error(e)) => return Err(e).context("playback failed"),
            Ok(SessionEvent::StateChanged(state)) => tracing::debug!(?state, "session state"),
            Ok(SessionEvent::Ready) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
        if Instant::now() >= next_report {
            print_snapshot(&controller.snapshot())?;
            next_report += every;
        }
    }
}

fn print_snapshot(snapshot: &TelemetrySnapshot) -> Result<()> {
    println!("{}", serde_json::to_string(snapshot)?);
    Ok(())
}

/// Defaults, then the config file, then command-line overrides.
fn stream_config(args: &cli::Args) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    if let Some(ms) = args.buffer_ms {
        config.buffer_latency_ms = ms;
    }
    if let Some(frames) = args.block_frames {
        config.block_frames = frames;
    }
    if let Some(cycles) = args.cycles_per_frame {
        config.strategy.cycles_per_frame = cycles;
    }
    config.validate()?;
    Ok(config)
}

/// Seconds between snapshots, floored at 100 ms.
fn telemetry_interval(secs: f32) -> Result<Duration> {
    Duration::try_from_secs_f32(secs.max(0.1))
        .with_context(|| format!("invalid --telemetry-secs {secs}"))
}

fn engine_kind(choice: cli::EngineChoice, track: &[u8]) -> EngineKind {
    match choice {
        cli::EngineChoice::Auto => EngineKind::detect(track),
        cli::EngineChoice::Pulse => EngineKind::Pulse,
        cli::EngineChoice::Decode => EngineKind::Decode,
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chip_stream::engine::PulseSong;

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("   ".into())), None);
        assert_eq!(
            normalize_device_name(Some("  USB DAC ".into())),
            Some("USB DAC".to_string())
        );
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let args = cli::Args::try_parse_from([
            "chip-play",
            "song.pls",
            "--buffer-ms",
            "500",
            "--cycles-per-frame",
            "40",
        ])
        .unwrap();
        let config = stream_config(&args).unwrap();
        assert_eq!(config.buffer_latency_ms, 500);
        assert_eq!(config.strategy.cycles_per_frame, 40.0);
        assert_eq!(config.block_frames, StreamConfig::default().block_frames);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = cli::Args::try_parse_from(["chip-play", "song.pls", "--block-frames", "0"])
            .unwrap();
        assert!(stream_config(&args).is_err());
    }

    #[test]
    fn telemetry_interval_rejects_unrepresentable_values() {
        assert_eq!(telemetry_interval(2.0).unwrap(), Duration::from_secs(2));
        assert_eq!(telemetry_interval(0.0).unwrap(), Duration::from_secs_f32(0.1));
        assert!(telemetry_interval(f32::INFINITY).is_err());
    }

    #[test]
    fn auto_engine_follows_track_header() {
        let song = PulseSong::demo().to_bytes();
        assert_eq!(engine_kind(cli::EngineChoice::Auto, &song), EngineKind::Pulse);
        assert_eq!(engine_kind(cli::EngineChoice::Auto, b"fLaC"), EngineKind::Decode);
        assert_eq!(engine_kind(cli::EngineChoice::Decode, &song), EngineKind::Decode);
    }
}
