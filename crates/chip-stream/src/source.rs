//! Track sources and how their bytes are fetched.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Where a track's bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl TrackSource {
    /// Short label for logs.
    pub fn describe(&self) -> String {
        match self {
            TrackSource::Path(p) => p.display().to_string(),
            TrackSource::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// What to play.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackSession {
    pub source: TrackSource,
    pub subtrack: u32,
    pub duration_hint_ms: Option<u64>,
}

impl PlaybackSession {
    pub fn new(source: TrackSource) -> Self {
        Self {
            source,
            subtrack: 0,
            duration_hint_ms: None,
        }
    }

    pub fn with_subtrack(mut self, subtrack: u32) -> Self {
        self.subtrack = subtrack;
        self
    }

    pub fn with_duration_hint(mut self, ms: u64) -> Self {
        self.duration_hint_ms = Some(ms);
        self
    }
}

/// Resolves a [`TrackSource`] into bytes for the engine.
pub trait SourceLoader: Send {
    fn fetch(&self, source: &TrackSource) -> Result<Vec<u8>>;
}

/// Reads paths from the local filesystem and passes byte sources through.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn fetch(&self, source: &TrackSource) -> Result<Vec<u8>> {
        let bytes = match source {
            TrackSource::Path(path) => {
                std::fs::read(path).with_context(|| format!("read track {:?}", path))?
            }
            TrackSource::Bytes(bytes) => bytes.clone(),
        };
        if bytes.is_empty() {
            bail!("track {} is empty", source.describe());
        }
        Ok(bytes)
    }
}
