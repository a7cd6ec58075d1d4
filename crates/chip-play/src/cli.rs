use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "chip-play", version)]
pub struct Args {
    /// Track to play (PLS1 pulse song or any decodable audio file)
    #[arg(required_unless_present = "list_devices")]
    pub path: Option<PathBuf>,

    /// Sub-track index inside the track
    #[arg(long, default_value_t = 0)]
    pub subtrack: u32,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Preferred output sample rate; the device picks the closest it supports
    #[arg(long)]
    pub rate: Option<u32>,

    /// TOML file with streaming overrides
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Ring buffer target in milliseconds (higher => more underrun resistance, more latency)
    #[arg(long)]
    pub buffer_ms: Option<u32>,

    /// Output quantum in frames
    #[arg(long)]
    pub block_frames: Option<usize>,

    /// Emulated chip cycles per output frame
    #[arg(long)]
    pub cycles_per_frame: Option<f64>,

    /// Seconds between telemetry lines on stdout
    #[arg(long, default_value_t = 2.0)]
    pub telemetry_secs: f32,

    /// Renderer to use
    #[arg(long, value_enum, default_value_t = EngineChoice::Auto)]
    pub engine: EngineChoice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineChoice {
    /// Pick from the track header
    Auto,
    /// Built-in pulse-wave synth
    Pulse,
    /// Decode and resample an audio file
    Decode,
}
