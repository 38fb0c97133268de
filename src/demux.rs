//! Packet demultiplexer and FEC block assembly
//!
//! Cleartext payloads from the tunnel carry a one-byte channel id
//! followed by a RaptorQ encoding packet: a 4-byte payload id (source
//! block number + symbol id) and one symbol of `L` bytes. Symbols for a
//! block accumulate until the decoder can reconstruct the `K * L`-byte
//! payload slab, which is then handed to the channel's sink exactly once.
//!
//! Redundant paths deliver the same blocks more than once and UDP can
//! reorder across paths, so delivery is gated on the 8-bit source block
//! number: duplicates and stale blocks are counted and suppressed, and a
//! forward jump tells the sink to drop any partially framed packet
//! before suppressing the block that starts mid-stream.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use raptorq::{Decoder, EncodingPacket, ObjectTransmissionInformation, PayloadId};
use tracing::trace;

use crate::constants::MAX_ENDPOINTS;
use crate::net::PacketSink;
use crate::stats;

/// Consumes decoded payload slabs for one channel
pub trait BlockSink: Send {
    /// One in-order `K * L`-byte slab
    fn on_block(&mut self, slab: &[u8], sbn: u8);
    /// The stream skipped ahead; partial framing state must be dropped
    fn on_jump(&mut self);
}

/// Static parameters of one logical channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub ch_id: u8,
    /// K: source symbols per block
    pub symbols_per_block: usize,
    /// L: bytes per symbol
    pub symbol_len: usize,
}

impl ChannelSpec {
    /// Slab size of one decoded block
    pub fn block_len(&self) -> usize {
        self.symbols_per_block * self.symbol_len
    }

    /// Transmission parameters for one FEC block of this channel
    pub fn block_oti(&self) -> ObjectTransmissionInformation {
        ObjectTransmissionInformation::new(self.block_len() as u64, self.symbol_len as u16, 1, 1, 1)
    }
}

struct ChannelInner {
    /// SBN of the last decoded block, -1 before the first one
    sbn_last: i32,
    /// Block currently being accumulated
    current: Option<(u8, Decoder)>,
    sink: Box<dyn BlockSink>,
}

struct Channel {
    spec: ChannelSpec,
    /// Serialises block delivery across receive threads
    inner: Mutex<ChannelInner>,
}

/// Channel-polymorphic packet demultiplexer
#[derive(Default)]
pub struct Demux {
    channels: Vec<Channel>,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Call before any packets flow.
    pub fn add_channel(&mut self, spec: ChannelSpec, sink: Box<dyn BlockSink>) {
        self.channels.push(Channel {
            spec,
            inner: Mutex::new(ChannelInner {
                sbn_last: -1,
                current: None,
                sink,
            }),
        });
    }

    /// Route one cleartext payload from endpoint `ep_index`
    pub fn read_packet(&self, buf: &[u8], ep_index: usize) {
        // ch_id + payload id + at least one symbol byte
        if buf.len() < 6 {
            trace!(len = buf.len(), "runt payload");
            return;
        }
        let ch_id = buf[0];
        let Some(channel) = self.channels.iter().find(|c| c.spec.ch_id == ch_id) else {
            trace!(ch_id, "payload for unknown channel");
            return;
        };
        let packet = EncodingPacket::deserialize(&buf[1..]);
        if packet.data().len() != channel.spec.symbol_len {
            trace!(
                len = packet.data().len(),
                expected = channel.spec.symbol_len,
                "symbol length mismatch"
            );
            return;
        }
        let sbn = packet.payload_id().source_block_number();
        if ep_index < MAX_ENDPOINTS {
            stats::registry().channel.last_sbn[ep_index].store(i32::from(sbn), Ordering::Relaxed);
        }

        let mut inner = channel.inner.lock().unwrap_or_else(|e| e.into_inner());

        // A symbol for a different block abandons the partial one; symbols
        // are never held across block boundaries.
        if inner
            .current
            .as_ref()
            .map_or(true, |(current_sbn, _)| *current_sbn != sbn)
        {
            inner.current = Some((sbn, Decoder::new(channel.spec.block_oti())));
        }

        // The decoder tracks a single block, so the wire SBN maps to
        // block zero of its transmission parameters.
        let esi = packet.payload_id().encoding_symbol_id();
        let renumbered = EncodingPacket::new(PayloadId::new(0, esi), packet.data().to_vec());

        let decoded = inner
            .current
            .as_mut()
            .and_then(|(_, decoder)| decoder.decode(renumbered));
        if let Some(slab) = decoded {
            inner.current = None;
            deliver(&mut inner, &slab, sbn);
        }
    }
}

/// Apply the SBN ordering decision and hand the slab on when it is next
/// in sequence.
fn deliver(inner: &mut ChannelInner, slab: &[u8], sbn: u8) {
    let channel_stats = &stats::registry().channel;
    let sbn = i32::from(sbn);

    let diff = if inner.sbn_last < 0 {
        1
    } else if inner.sbn_last - sbn > 128 {
        // 8-bit wraparound
        256 - inner.sbn_last + sbn
    } else {
        sbn - inner.sbn_last
    };
    channel_stats.last_block_sbn_diff.store(diff, Ordering::Relaxed);
    inner.sbn_last = sbn;

    match diff {
        0 => stats::add_u32(&channel_stats.dup_block_count, 1),
        1 => inner.sink.on_block(slab, sbn as u8),
        d if d < 0 => stats::add_u32(&channel_stats.ooo_block_count, 1),
        d => {
            // Forward jump: the next slab starts mid-packet.
            stats::add_u32(&channel_stats.ooo_block_count, (d - 1) as u32);
            inner.sink.on_jump();
        }
    }
}

impl PacketSink for Demux {
    fn on_packet(&self, buf: &[u8], ep_index: usize) {
        self.read_packet(buf, ep_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raptorq::Encoder;
    use std::sync::{Arc, Mutex as StdMutex};

    const SPEC: ChannelSpec = ChannelSpec {
        ch_id: 1,
        symbols_per_block: 4,
        symbol_len: 64,
    };

    #[derive(Default)]
    struct Recorder {
        blocks: Vec<(u8, Vec<u8>)>,
        jumps: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<StdMutex<Recorder>>);

    impl BlockSink for RecordingSink {
        fn on_block(&mut self, slab: &[u8], sbn: u8) {
            self.0.lock().unwrap().blocks.push((sbn, slab.to_vec()));
        }
        fn on_jump(&mut self) {
            self.0.lock().unwrap().jumps += 1;
        }
    }

    fn demux_with_recorder() -> (Demux, RecordingSink) {
        let sink = RecordingSink::default();
        let mut demux = Demux::new();
        demux.add_channel(SPEC, Box::new(sink.clone()));
        (demux, sink)
    }

    fn slab_for(sbn: u8) -> Vec<u8> {
        (0..SPEC.block_len()).map(|i| (i as u8) ^ sbn).collect()
    }

    /// Wire packets (ch_id + encoding packet) for one block, including
    /// `repair` repair symbols.
    fn wire_packets(sbn: u8, repair: u32) -> Vec<Vec<u8>> {
        let encoder = Encoder::new(&slab_for(sbn), SPEC.block_oti());
        encoder
            .get_encoded_packets(repair)
            .into_iter()
            .map(|pkt| {
                let renumbered = EncodingPacket::new(
                    PayloadId::new(sbn, pkt.payload_id().encoding_symbol_id()),
                    pkt.data().to_vec(),
                );
                let mut wire = vec![SPEC.ch_id];
                wire.extend_from_slice(&renumbered.serialize());
                wire
            })
            .collect()
    }

    fn feed_block(demux: &Demux, sbn: u8, ep: usize) {
        for wire in wire_packets(sbn, 0) {
            demux.read_packet(&wire, ep);
        }
    }

    #[test]
    fn sequential_blocks_deliver_in_order() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        for sbn in 0..5u8 {
            feed_block(&demux, sbn, 0);
        }
        let recorder = sink.0.lock().unwrap();
        assert_eq!(recorder.blocks.len(), 5);
        for (i, (sbn, slab)) in recorder.blocks.iter().enumerate() {
            assert_eq!(*sbn, i as u8);
            assert_eq!(slab, &slab_for(i as u8));
        }
        assert_eq!(recorder.jumps, 0);
        let ch = &stats::registry().channel;
        assert_eq!(ch.dup_block_count.load(Ordering::Relaxed), 0);
        assert_eq!(ch.ooo_block_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn duplicate_block_suppressed_and_counted() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        feed_block(&demux, 0, 0);
        feed_block(&demux, 1, 0);
        feed_block(&demux, 1, 1); // same block via the other path
        let recorder = sink.0.lock().unwrap();
        assert_eq!(recorder.blocks.len(), 2);
        assert_eq!(
            stats::registry()
                .channel
                .dup_block_count
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn forward_jump_resets_sink_and_skips_block() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        for sbn in [0u8, 1, 2, 5, 6, 7] {
            feed_block(&demux, sbn, 0);
        }
        let recorder = sink.0.lock().unwrap();
        // Block 5 begins mid-packet and is dropped; 6 and 7 flow again.
        let delivered: Vec<u8> = recorder.blocks.iter().map(|(sbn, _)| *sbn).collect();
        assert_eq!(delivered, vec![0, 1, 2, 6, 7]);
        assert_eq!(recorder.jumps, 1);
        assert_eq!(
            stats::registry()
                .channel
                .ooo_block_count
                .load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn stale_block_counted_not_delivered() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        feed_block(&demux, 10, 0);
        feed_block(&demux, 11, 0);
        feed_block(&demux, 9, 0); // late straggler
        let recorder = sink.0.lock().unwrap();
        let delivered: Vec<u8> = recorder.blocks.iter().map(|(sbn, _)| *sbn).collect();
        assert_eq!(delivered, vec![10, 11]);
        assert_eq!(
            stats::registry()
                .channel
                .ooo_block_count
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn sbn_wraps_around_cleanly() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        feed_block(&demux, 254, 0);
        feed_block(&demux, 255, 0);
        feed_block(&demux, 0, 0);
        feed_block(&demux, 1, 0);
        let recorder = sink.0.lock().unwrap();
        let delivered: Vec<u8> = recorder.blocks.iter().map(|(sbn, _)| *sbn).collect();
        assert_eq!(delivered, vec![254, 255, 0, 1]);
        assert_eq!(
            stats::registry()
                .channel
                .ooo_block_count
                .load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn repair_symbol_recovers_lost_source_symbol() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, sink) = demux_with_recorder();
        let mut wire = wire_packets(0, 1);
        assert_eq!(wire.len(), SPEC.symbols_per_block + 1);
        wire.remove(1); // lose one source symbol, keep the repair symbol
        for packet in wire {
            demux.read_packet(&packet, 0);
        }
        let recorder = sink.0.lock().unwrap();
        assert_eq!(recorder.blocks.len(), 1);
        assert_eq!(recorder.blocks[0].1, slab_for(0));
    }

    #[test]
    fn last_sbn_tracked_per_endpoint() {
        let _guard = stats::test_guard();
        stats::init();
        let (demux, _sink) = demux_with_recorder();
        feed_block(&demux, 42, 3);
        assert_eq!(
            stats::registry().channel.last_sbn[3].load(Ordering::Relaxed),
            42
        );
    }

    #[test]
    fn unknown_channel_and_runts_ignored() {
        let _guard = stats::test_guard();
        let (demux, sink) = demux_with_recorder();
        demux.read_packet(&[9, 0, 0, 0, 0, 1, 2, 3], 0);
        demux.read_packet(&[1, 0], 0);
        assert!(sink.0.lock().unwrap().blocks.is_empty());
    }
}
