//! Process-wide stats registry
//!
//! Every field is an individual atomic so the audio callback and the
//! network threads can publish without locks or allocation. Readers may
//! observe a snapshot that is slightly inconsistent across fields but
//! never a torn scalar. Monotonic counters use wrapping arithmetic.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::constants::{
    BLOCK_TIMING_RING_LEN, MAX_AUDIO_CHANNELS, MAX_ENDPOINTS, STREAM_METER_BINS,
};

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_U32: AtomicU32 = AtomicU32::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const ZERO_U64: AtomicU64 = AtomicU64::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const ZERO_I32: AtomicI32 = AtomicI32::new(0);

/// Per-channel block accounting (demux side)
pub struct ChannelStats {
    /// Blocks whose SBN repeated the previous one
    pub dup_block_count: AtomicU32,
    /// Blocks that arrived old or skipped ahead (per skipped SBN)
    pub ooo_block_count: AtomicU32,
    /// Signed SBN delta observed at the last decoded block
    pub last_block_sbn_diff: AtomicI32,
    /// Last SBN seen per endpoint, for cross-path skew display
    pub last_sbn: [AtomicI32; MAX_ENDPOINTS],
}

/// Audio-side accounting (syncer + device callback)
pub struct AudioStats {
    pub buffer_underrun_count: AtomicU32,
    pub buffer_overrun_count: AtomicU32,
    pub audio_loop_xrun_count: AtomicU32,
    /// Ring occupancy sampled at the last device callback
    pub stream_buffer_pos: AtomicU32,
    /// EWMA of the ring occupancy, written by the device callback (f64 bits)
    pub filtered_fill: AtomicU64,
    /// Current effective resampling ratio (f64 bits)
    pub sync_ratio: AtomicU64,
    /// Histogram of callback-time ring fill levels
    pub stream_meter_bins: [AtomicU32; STREAM_METER_BINS],
    /// Microsecond timestamps of recent device callbacks
    pub block_timing_ring: [AtomicU32; BLOCK_TIMING_RING_LEN],
    pub block_timing_ring_pos: AtomicU32,
    /// Samples that hit the [-1, 1] rails, per channel
    pub clipping_counts: [AtomicU32; MAX_AUDIO_CHANNELS],
    /// Fast/slow peak level meters, per channel (f64 bits)
    pub levels_fast: [AtomicU64; MAX_AUDIO_CHANNELS],
    pub levels_slow: [AtomicU64; MAX_AUDIO_CHANNELS],
}

/// Codec-stage accounting
pub struct CodecStats {
    /// Opus packets whose decoded length was wrong
    pub codec_error_count: AtomicU32,
    /// PCM packets that failed the length or CRC check
    pub crc_fail_count: AtomicU32,
}

/// Per-path accounting
pub struct EndpointStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub open: AtomicU32,
    /// Declared for the monitor schema; nothing updates it yet
    pub send_congestion: AtomicU32,
}

pub struct StatsRegistry {
    pub channel: ChannelStats,
    pub audio: AudioStats,
    pub codec: CodecStats,
    pub endpoints: [EndpointStats; MAX_ENDPOINTS],
}

#[allow(clippy::declare_interior_mutable_const)]
const ENDPOINT_ZERO: EndpointStats = EndpointStats {
    bytes_in: ZERO_U64,
    bytes_out: ZERO_U64,
    open: ZERO_U32,
    send_congestion: ZERO_U32,
};

static REGISTRY: StatsRegistry = StatsRegistry {
    channel: ChannelStats {
        dup_block_count: ZERO_U32,
        ooo_block_count: ZERO_U32,
        last_block_sbn_diff: ZERO_I32,
        last_sbn: [ZERO_I32; MAX_ENDPOINTS],
    },
    audio: AudioStats {
        buffer_underrun_count: ZERO_U32,
        buffer_overrun_count: ZERO_U32,
        audio_loop_xrun_count: ZERO_U32,
        stream_buffer_pos: ZERO_U32,
        filtered_fill: ZERO_U64,
        sync_ratio: ZERO_U64,
        stream_meter_bins: [ZERO_U32; STREAM_METER_BINS],
        block_timing_ring: [ZERO_U32; BLOCK_TIMING_RING_LEN],
        block_timing_ring_pos: ZERO_U32,
        clipping_counts: [ZERO_U32; MAX_AUDIO_CHANNELS],
        levels_fast: [ZERO_U64; MAX_AUDIO_CHANNELS],
        levels_slow: [ZERO_U64; MAX_AUDIO_CHANNELS],
    },
    codec: CodecStats {
        codec_error_count: ZERO_U32,
        crc_fail_count: ZERO_U32,
    },
    endpoints: [ENDPOINT_ZERO; MAX_ENDPOINTS],
};

/// The process-global registry
pub fn registry() -> &'static StatsRegistry {
    &REGISTRY
}

/// Zero every field. Call once at startup before any thread publishes.
pub fn init() {
    let r = registry();
    r.channel.dup_block_count.store(0, Ordering::Relaxed);
    r.channel.ooo_block_count.store(0, Ordering::Relaxed);
    r.channel.last_block_sbn_diff.store(0, Ordering::Relaxed);
    for sbn in &r.channel.last_sbn {
        sbn.store(0, Ordering::Relaxed);
    }
    r.audio.buffer_underrun_count.store(0, Ordering::Relaxed);
    r.audio.buffer_overrun_count.store(0, Ordering::Relaxed);
    r.audio.audio_loop_xrun_count.store(0, Ordering::Relaxed);
    r.audio.stream_buffer_pos.store(0, Ordering::Relaxed);
    r.audio.filtered_fill.store(0, Ordering::Relaxed);
    r.audio.sync_ratio.store(0, Ordering::Relaxed);
    for bin in &r.audio.stream_meter_bins {
        bin.store(0, Ordering::Relaxed);
    }
    for slot in &r.audio.block_timing_ring {
        slot.store(0, Ordering::Relaxed);
    }
    r.audio.block_timing_ring_pos.store(0, Ordering::Relaxed);
    for count in &r.audio.clipping_counts {
        count.store(0, Ordering::Relaxed);
    }
    for level in r.audio.levels_fast.iter().chain(&r.audio.levels_slow) {
        level.store(0, Ordering::Relaxed);
    }
    r.codec.codec_error_count.store(0, Ordering::Relaxed);
    r.codec.crc_fail_count.store(0, Ordering::Relaxed);
    for ep in &r.endpoints {
        ep.bytes_in.store(0, Ordering::Relaxed);
        ep.bytes_out.store(0, Ordering::Relaxed);
        ep.open.store(0, Ordering::Relaxed);
        ep.send_congestion.store(0, Ordering::Relaxed);
    }
}

/// Wrapping increment for a monotonic counter
pub fn add_u32(counter: &AtomicU32, n: u32) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Wrapping increment for a monotonic byte counter
pub fn add_u64(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Store an f64 gauge as its bit pattern
pub fn set_f64(gauge: &AtomicU64, value: f64) {
    gauge.store(value.to_bits(), Ordering::Relaxed);
}

/// Read an f64 gauge
pub fn get_f64(gauge: &AtomicU64) -> f64 {
    f64::from_bits(gauge.load(Ordering::Relaxed))
}

/// Serialises tests that assert on the global registry. The registry is
/// process-wide and the test harness runs threads in parallel.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
