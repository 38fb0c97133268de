//! Receive pipeline assembly
//!
//! Binds the framer, the codec stage and the syncer into the block sink
//! the demux channel drives. The demux holds the channel lock for the
//! whole of [`BlockSink::on_block`], so this struct is single-threaded
//! by construction even though blocks arrive from several receive
//! threads.

use tracing::trace;

use crate::codec::PacketDecoder;
use crate::config::AppConfig;
use crate::demux::BlockSink;
use crate::error::Result;
use crate::framer::SlipFramer;
use crate::ring::RingProducer;
use crate::syncer::{Syncer, SyncerRateHandle};

pub struct AudioPipeline {
    framer: SlipFramer,
    decoder: PacketDecoder,
    syncer: Syncer,
}

impl AudioPipeline {
    /// Build the decode side of the receiver. Pre-fills the ring with
    /// half a ring of silence via the syncer.
    pub fn new(config: &AppConfig, producer: RingProducer) -> Result<Self> {
        let decoder = PacketDecoder::new(config)?;
        Ok(Self {
            framer: SlipFramer::new(config.max_packet_size()),
            syncer: Syncer::new(
                f64::from(config.encoded_sample_rate()),
                f64::from(config.audio.io_sample_rate),
                config.audio.channel_count as usize,
                producer,
            ),
            decoder,
        })
    }

    /// Handle for the clock-feedback controller
    pub fn rate_handle(&self) -> SyncerRateHandle {
        self.syncer.rate_handle()
    }
}

impl BlockSink for AudioPipeline {
    fn on_block(&mut self, slab: &[u8], _sbn: u8) {
        let Self {
            framer,
            decoder,
            syncer,
        } = self;
        framer.feed(slab, |packet| {
            if let Some(samples) = decoder.decode(packet) {
                if syncer.enqueue(samples).is_err() {
                    // The syncer stays stalled until the ring drains to
                    // half; blocks decoded meanwhile are dropped.
                    trace!("ring overrun, block dropped");
                }
            }
        });
    }

    fn on_jump(&mut self) {
        self.framer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pcm;
    use crate::config::{Encoding, EndpointConfig};
    use crate::framer;
    use crate::ring::SampleRing;
    use crate::stats;

    fn pcm_config(channels: u16, frame_size: usize, ring_len: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.encoding = Encoding::Pcm;
        config.audio.channel_count = channels;
        config.pcm.frame_size = frame_size;
        config.pcm.decode_ring_length = ring_len;
        config.endpoints.push(EndpointConfig {
            interface: String::new(),
            port: 0,
        });
        config
    }

    fn slab_with_packets(packets: &[&[u8]]) -> Vec<u8> {
        let mut slab = Vec::new();
        for packet in packets {
            framer::encode(packet, &mut slab);
            slab.push(framer::END);
        }
        slab
    }

    #[test]
    fn block_flows_through_to_the_ring() {
        let _guard = stats::test_guard();
        stats::init();
        let config = pcm_config(1, 4, 1024);
        let ring = SampleRing::new(1024, 1);
        let (prod, mut cons) = ring.split();
        let mut pipeline = AudioPipeline::new(&config, prod).unwrap();
        let mut drain = vec![0.0f32; 1024];
        cons.pop_slice(&mut drain); // discard pre-fill

        let packet = pcm::encode_packet(&[0.5, -0.5, 0.25, -0.25]);
        let slab = slab_with_packets(&[&packet]);
        pipeline.on_block(&slab, 0);

        // The interpolator holds back tail frames; at least one sample
        // of the 4-frame packet must have reached the ring.
        assert!(cons.pop_slice(&mut drain) >= 1);
    }

    #[test]
    fn jump_drops_partial_packet() {
        let _guard = stats::test_guard();
        stats::init();
        let config = pcm_config(1, 4, 1024);
        let (prod, mut cons) = SampleRing::new(1024, 1).split();
        let mut pipeline = AudioPipeline::new(&config, prod).unwrap();
        let mut drain = vec![0.0f32; 1024];
        cons.pop_slice(&mut drain);

        let packet = pcm::encode_packet(&[0.1, 0.2, 0.3, 0.4]);
        let mut encoded = Vec::new();
        framer::encode(&packet, &mut encoded);
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        // First half of a packet, then a stream jump, then the rest.
        pipeline.on_block(head, 0);
        pipeline.on_jump();
        let mut remainder = tail.to_vec();
        remainder.push(framer::END);
        pipeline.on_block(&remainder, 1);

        // The stitched-together halves never formed a valid packet.
        assert_eq!(cons.pop_slice(&mut drain), 0);
        assert_eq!(
            stats::registry()
                .codec
                .crc_fail_count
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
