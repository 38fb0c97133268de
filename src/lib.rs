//! # Airlift (receive side)
//!
//! Low-latency audio transport over redundant encrypted UDP paths.
//!
//! The sender fragments an encoded audio stream into forward-error-corrected
//! blocks and replicates them across several WireGuard-protected paths. This
//! crate is the receiving half: it ingests all paths concurrently, rebuilds
//! the original byte stream, decodes it to PCM and plays it out through a
//! continuously running audio device.
//!
//! ## Architecture Overview
//!
//! ```text
//!        path 0              path 1              path N-1
//!    ┌───────────┐       ┌───────────┐       ┌───────────┐
//!    │ UDP socket│       │ UDP socket│       │ UDP socket│
//!    │ (iface 0) │       │ (iface 1) │       │ (iface N) │
//!    └─────┬─────┘       └─────┬─────┘       └─────┬─────┘
//!          │ ciphertext        │                   │
//!          ▼                   ▼                   ▼
//!    ┌─────────────────────────────────────────────────┐
//!    │       shared WireGuard tunnel (net::tunnel)      │
//!    └────────────────────────┬────────────────────────┘
//!                             │ cleartext (per-path thread)
//!                             ▼
//!    ┌─────────────────────────────────────────────────┐
//!    │  demux: channel routing, SBN dedup, FEC decode   │
//!    └────────────────────────┬────────────────────────┘
//!                             │ payload slab (channel lock held)
//!                             ▼
//!    ┌──────────┐      ┌─────────────┐      ┌──────────┐
//!    │  framer  │ ───▶ │ codec stage │ ───▶ │  syncer  │
//!    │  (SLIP)  │      │ (Opus/PCM)  │      │ (SRC+PI) │
//!    └──────────┘      └─────────────┘      └─────┬────┘
//!                                                 │ f32 samples
//!                                                 ▼
//!    ┌─────────────────────────────────────────────────┐
//!    │        lock-free SPSC sample ring (ring)         │
//!    └────────────────────────┬────────────────────────┘
//!                             │ device callback
//!                             ▼
//!    ┌─────────────────────────────────────────────────┐
//!    │        audio output bridge (audio::output)       │
//!    └─────────────────────────────────────────────────┘
//! ```
//!
//! Clock steering runs in the opposite direction: the device callback
//! publishes the ring fill level into the global [`stats`] registry, and a
//! slow feedback loop nudges the syncer's resampling ratio so the fill
//! tends to half the ring.

pub mod audio;
pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod framer;
pub mod monitor;
pub mod net;
pub mod pipeline;
pub mod ring;
pub mod stats;
pub mod syncer;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Opus always runs at 48 kHz on the wire
    pub const OPUS_SAMPLE_RATE: u32 = 48_000;

    /// Upper bound on configured network paths
    pub const MAX_ENDPOINTS: usize = 8;

    /// Upper bound on interleaved audio channels
    pub const MAX_AUDIO_CHANNELS: usize = 8;

    /// Largest UDP datagram we send or receive
    pub const MAX_DATAGRAM_SIZE: usize = 1500;

    /// Synthetic IPv4 header prepended to tunnel payloads
    pub const IPV4_HEADER_LEN: usize = 20;

    /// IPv4 + UDP header overhead counted into byte stats
    pub const UDP_IP_OVERHEAD: u64 = 28;

    /// WireGuard timer tick interval in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 100;

    /// Bins in the ring fill-level histogram
    pub const STREAM_METER_BINS: usize = 64;

    /// Slots in the audio callback timing ring
    pub const BLOCK_TIMING_RING_LEN: usize = 64;
}
