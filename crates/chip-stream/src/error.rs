//! Error taxonomy surfaced by the streaming pipeline.
//!
//! Underruns and backpressure stalls are transient and only show up as
//! telemetry counters.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Shared-memory capability missing, engine load failed, or the session
    /// could not be set up. Fatal, never retried.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The synthesis engine stopped producing audio while input remained.
    #[error("engine fault: {0}")]
    EngineFault(String),

    /// A control acknowledgment did not arrive in time.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    /// The requested operation is not valid in the current session state.
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// The host audio output could not be opened or started.
    #[error("audio output: {0}")]
    Output(String),

    #[error("config: {0}")]
    Config(String),
}

impl StreamError {
    /// Wrap an engine-side `anyhow` error, keeping the full context chain.
    pub(crate) fn engine(err: &anyhow::Error) -> Self {
        Self::EngineFault(format!("{err:#}"))
    }

    pub(crate) fn init(err: &anyhow::Error) -> Self {
        Self::Initialization(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn engine_error_keeps_context_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("bad opcode"))
            .context("render subtrack 2")
            .unwrap_err();
        let wrapped = StreamError::engine(&err);
        assert_eq!(
            wrapped,
            StreamError::EngineFault("render subtrack 2: bad opcode".to_string())
        );
    }

    #[test]
    fn timeout_message_names_the_wait() {
        let err = StreamError::Timeout {
            what: "load ack",
            waited: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "timed out after 250ms waiting for load ack");
    }
}
