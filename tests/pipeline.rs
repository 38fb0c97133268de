//! End-to-end pipeline tests, socket- and device-free
//!
//! Fabricated FEC symbols run the real demux → framer → PCM decode →
//! syncer path into the sample ring, mirroring what a receive thread
//! does after decryption.

use std::sync::Mutex;

use raptorq::{Encoder, EncodingPacket, PayloadId};

use airlift::codec::pcm;
use airlift::config::{AppConfig, Encoding, EndpointConfig};
use airlift::demux::{ChannelSpec, Demux};
use airlift::framer;
use airlift::pipeline::AudioPipeline;
use airlift::ring::{RingConsumer, SampleRing};
use airlift::stats;

/// The stats registry is process-global; run these tests one at a time.
static TEST_LOCK: Mutex<()> = Mutex::new(());

const CHANNEL_ID: u8 = 1;
const K: usize = 4;
const L: usize = 48;
const FRAME_SIZE: usize = 4;
const RING_LEN: usize = 1024;

const SPEC: ChannelSpec = ChannelSpec {
    ch_id: CHANNEL_ID,
    symbols_per_block: K,
    symbol_len: L,
};

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.audio.encoding = Encoding::Pcm;
    config.audio.channel_count = 1;
    config.audio.io_sample_rate = 48_000;
    config.pcm.sample_rate = 48_000;
    config.pcm.frame_size = FRAME_SIZE;
    config.pcm.decode_ring_length = RING_LEN;
    config.fec.source_symbols_per_block = K;
    config.fec.symbol_len = L;
    config.endpoints.push(EndpointConfig {
        interface: String::new(),
        port: 0,
    });
    config
}

/// Build a receiver: demux with the audio pipeline on channel 1, plus
/// the consumer half of its ring.
fn build_receiver() -> (Demux, RingConsumer) {
    let config = test_config();
    let (producer, consumer) = SampleRing::new(RING_LEN, 1).split();
    let pipeline = AudioPipeline::new(&config, producer).unwrap();
    let mut demux = Demux::new();
    demux.add_channel(SPEC, Box::new(pipeline));
    (demux, consumer)
}

/// SLIP-frame packets into one padded FEC payload slab
fn make_slab(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut slab = Vec::new();
    for packet in packets {
        framer::encode(packet, &mut slab);
        slab.push(framer::END);
    }
    assert!(slab.len() <= SPEC.block_len(), "packets exceed block size");
    // Spare bytes read as empty frames and are skipped by the framer.
    slab.resize(SPEC.block_len(), framer::END);
    slab
}

/// Wire packets (channel id + encoding packet) for one block
fn wire_symbols(sbn: u8, slab: &[u8]) -> Vec<Vec<u8>> {
    let encoder = Encoder::new(slab, SPEC.block_oti());
    encoder
        .get_encoded_packets(0)
        .into_iter()
        .map(|pkt| {
            let renumbered = EncodingPacket::new(
                PayloadId::new(sbn, pkt.payload_id().encoding_symbol_id()),
                pkt.data().to_vec(),
            );
            let mut wire = vec![CHANNEL_ID];
            wire.extend_from_slice(&renumbered.serialize());
            wire
        })
        .collect()
}

fn ramp_packet(block: usize) -> Vec<u8> {
    let samples: Vec<f32> = (0..FRAME_SIZE)
        .map(|i| ((block * FRAME_SIZE + i) as f32) / 1024.0 - 0.4)
        .collect();
    pcm::encode_packet(&samples)
}

fn feed_block(demux: &Demux, sbn: u8, slab: &[u8], ep: usize) {
    for symbol in wire_symbols(sbn, slab) {
        demux.read_packet(&symbol, ep);
    }
}

fn drain(consumer: &mut RingConsumer) -> Vec<f32> {
    let mut buf = vec![0.0f32; RING_LEN];
    let n = consumer.pop_slice(&mut buf);
    buf.truncate(n);
    buf
}

#[test]
fn clean_path_delivers_every_block() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    stats::init();
    let (demux, mut consumer) = build_receiver();
    let prefill = drain(&mut consumer);
    assert_eq!(prefill.len(), RING_LEN / 2);

    let blocks = 20;
    for block in 0..blocks {
        let slab = make_slab(&[ramp_packet(block)]);
        feed_block(&demux, block as u8, &slab, 0);
    }

    let registry = stats::registry();
    let ordering = std::sync::atomic::Ordering::Relaxed;
    assert_eq!(registry.channel.dup_block_count.load(ordering), 0);
    assert_eq!(registry.channel.ooo_block_count.load(ordering), 0);
    assert_eq!(registry.codec.crc_fail_count.load(ordering), 0);

    // Identity ratio: the cubic interpolator trails the input by three
    // frames but otherwise passes every decoded sample through.
    let samples = drain(&mut consumer);
    assert_eq!(samples.len(), blocks * FRAME_SIZE - 3);
    for (i, &sample) in samples.iter().enumerate() {
        let expected = ((i + 1) as f32) / 1024.0 - 0.4;
        assert!((sample - expected).abs() < 1e-3, "sample {i}: {sample}");
    }
}

#[test]
fn duplicated_paths_deliver_once() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    stats::init();
    let (demux, mut consumer) = build_receiver();
    drain(&mut consumer);

    let blocks = 10;
    for block in 0..blocks {
        let slab = make_slab(&[ramp_packet(block)]);
        // Path 0 first, then the identical datagrams on path 1.
        feed_block(&demux, block as u8, &slab, 0);
        feed_block(&demux, block as u8, &slab, 1);
    }

    let registry = stats::registry();
    let ordering = std::sync::atomic::Ordering::Relaxed;
    assert_eq!(registry.channel.dup_block_count.load(ordering), blocks as u32);
    assert_eq!(registry.channel.ooo_block_count.load(ordering), 0);
    assert_eq!(registry.channel.last_sbn[0].load(ordering), blocks as i32 - 1);
    assert_eq!(registry.channel.last_sbn[1].load(ordering), blocks as i32 - 1);

    // Output matches a single clean pass.
    let samples = drain(&mut consumer);
    assert_eq!(samples.len(), blocks * FRAME_SIZE - 3);
}

#[test]
fn forward_jump_skips_and_recovers() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    stats::init();
    let (demux, mut consumer) = build_receiver();
    drain(&mut consumer);

    for sbn in [0u8, 1, 2, 5, 6, 7] {
        let slab = make_slab(&[ramp_packet(sbn as usize)]);
        feed_block(&demux, sbn, &slab, 0);
    }

    let registry = stats::registry();
    let ordering = std::sync::atomic::Ordering::Relaxed;
    // One jump of three (2 -> 5): two skipped SBNs, block 5 suppressed.
    assert_eq!(registry.channel.ooo_block_count.load(ordering), 2);
    assert_eq!(registry.codec.crc_fail_count.load(ordering), 0);

    // Five delivered blocks: 0, 1, 2, 6, 7.
    let samples = drain(&mut consumer);
    assert_eq!(samples.len(), 5 * FRAME_SIZE - 3);
}

#[test]
fn corrupted_packet_is_dropped_and_stream_continues() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    stats::init();
    let (demux, mut consumer) = build_receiver();
    drain(&mut consumer);

    let blocks = 10;
    for block in 0..blocks {
        let mut packet = ramp_packet(block);
        if block == 4 {
            // Flip one payload bit; stays clear of the SLIP specials.
            packet[0] ^= 0x01;
        }
        let slab = make_slab(&[packet]);
        feed_block(&demux, block as u8, &slab, 0);
    }

    let registry = stats::registry();
    let ordering = std::sync::atomic::Ordering::Relaxed;
    assert_eq!(registry.codec.crc_fail_count.load(ordering), 1);
    assert_eq!(registry.channel.dup_block_count.load(ordering), 0);
    assert_eq!(registry.channel.ooo_block_count.load(ordering), 0);

    // Nine good packets made it through.
    let samples = drain(&mut consumer);
    assert_eq!(samples.len(), (blocks - 1) * FRAME_SIZE - 3);
}
