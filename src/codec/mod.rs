//! Audio decoder stage
//!
//! Turns one codec packet into a block of interleaved `f32` frames.
//! Decode failures never propagate: the packet is dropped, the matching
//! counter is bumped and the stream continues with the next packet.

pub mod opus;
pub mod pcm;

pub use opus::OpusStage;
pub use pcm::PcmStage;

use crate::config::{AppConfig, Encoding};
use crate::error::CodecError;
use crate::stats;

/// Decoder stage selected by the `audio.encoding` configuration
pub enum PacketDecoder {
    Opus(OpusStage),
    Pcm(PcmStage),
}

impl PacketDecoder {
    pub fn new(config: &AppConfig) -> Result<Self, CodecError> {
        let channels = config.audio.channel_count as usize;
        match config.audio.encoding {
            Encoding::Opus => Ok(Self::Opus(OpusStage::new(
                config.audio.channel_count,
                config.opus.frame_size,
            )?)),
            Encoding::Pcm => Ok(Self::Pcm(PcmStage::new(channels, config.pcm.frame_size))),
        }
    }

    /// Decode one packet. `None` means the packet was dropped and counted.
    pub fn decode(&mut self, packet: &[u8]) -> Option<&[f32]> {
        let channels = self.channels();
        let samples = match self {
            Self::Opus(stage) => stage.decode(packet)?,
            Self::Pcm(stage) => stage.decode(packet)?,
        };
        update_level_meters(samples, channels);
        Some(samples)
    }

    /// Samples per channel in one decoded block
    pub fn frame_size(&self) -> usize {
        match self {
            Self::Opus(stage) => stage.frame_size(),
            Self::Pcm(stage) => stage.frame_size(),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::Opus(stage) => stage.channels(),
            Self::Pcm(stage) => stage.channels(),
        }
    }
}

/// Per-block peak decay for the fast level meter
const FAST_DECAY: f64 = 0.7;
/// Per-block peak decay for the slow level meter
const SLOW_DECAY: f64 = 0.97;

/// Update the per-channel peak meters and clipping counters
fn update_level_meters(samples: &[f32], channels: usize) {
    let audio = &stats::registry().audio;
    for ch in 0..channels.min(crate::constants::MAX_AUDIO_CHANNELS) {
        let mut peak = 0.0f64;
        let mut clipped = 0u32;
        for frame in samples.chunks_exact(channels) {
            let s = f64::from(frame[ch]);
            peak = peak.max(s.abs());
            if !(-1.0..=1.0).contains(&s) {
                clipped += 1;
            }
        }
        if clipped > 0 {
            stats::add_u32(&audio.clipping_counts[ch], clipped);
        }
        let fast = stats::get_f64(&audio.levels_fast[ch]) * FAST_DECAY;
        stats::set_f64(&audio.levels_fast[ch], fast.max(peak));
        let slow = stats::get_f64(&audio.levels_slow[ch]) * SLOW_DECAY;
        stats::set_f64(&audio.levels_slow[ch], slow.max(peak));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn meters_track_peak_and_clipping() {
        let _guard = stats::test_guard();
        stats::init();
        let samples = [0.5f32, -0.25, 1.5, 0.1];
        update_level_meters(&samples, 2);
        let audio = &stats::registry().audio;
        assert!(stats::get_f64(&audio.levels_fast[0]) >= 1.5);
        assert!(stats::get_f64(&audio.levels_fast[1]) >= 0.25);
        assert_eq!(audio.clipping_counts[0].load(Ordering::Relaxed), 1);
        assert_eq!(audio.clipping_counts[1].load(Ordering::Relaxed), 0);
    }
}
