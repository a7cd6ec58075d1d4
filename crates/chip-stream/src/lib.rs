pub mod clock;
pub mod config;
pub mod consumer;
pub mod controller;
pub mod device;
pub mod engine;
pub mod error;
pub mod output;
pub mod producer;
pub mod ring;
pub mod source;
pub mod strategy;
pub mod telemetry;

pub use controller::{Controller, SessionEvent};
pub use error::StreamError;
