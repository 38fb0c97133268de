//! Audio output subsystem
//!
//! Resolves the configured output device and runs the realtime callback
//! that drains the sample ring.

pub mod device;
pub mod output;

pub use output::AudioOutput;
