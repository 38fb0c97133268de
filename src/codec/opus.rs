//! Opus packet decoding

use opus::{Channels, Decoder};

use crate::constants::OPUS_SAMPLE_RATE;
use crate::error::CodecError;
use crate::stats;

/// Opus decoder stage
///
/// Every packet must decode to exactly `frame_size` samples per channel;
/// anything else (including decoder errors) counts as a codec error and
/// drops the packet.
pub struct OpusStage {
    decoder: Decoder,
    channels: usize,
    frame_size: usize,
    /// Reused to avoid allocating on the decode path
    decode_buf: Vec<f32>,
}

impl OpusStage {
    pub fn new(channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(CodecError::UnsupportedChannelCount(other)),
        };
        let decoder = Decoder::new(OPUS_SAMPLE_RATE, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        Ok(Self {
            decoder,
            channels: channels as usize,
            frame_size,
            decode_buf: vec![0.0; channels as usize * frame_size],
        })
    }

    /// Decode one packet to interleaved samples, or drop it
    pub fn decode(&mut self, packet: &[u8]) -> Option<&[f32]> {
        match self.decoder.decode_float(packet, &mut self.decode_buf, false) {
            Ok(frames) if frames == self.frame_size => {
                Some(&self.decode_buf[..self.frame_size * self.channels])
            }
            Ok(_) | Err(_) => {
                stats::add_u32(&stats::registry().codec.codec_error_count, 1);
                None
            }
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}
