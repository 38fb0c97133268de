//! Syncer: adaptive sample-rate conversion with clock feedback
//!
//! Decoded blocks arrive at the sender's nominal rate; the output device
//! consumes at its own clock. The syncer resamples every block with a
//! continuously variable ratio and a feedback controller nudges that
//! ratio so the bridge ring hovers around half full.
//!
//! The converter interpolates with a Catmull-Rom cubic over a four-frame
//! window and a fractional phase accumulator, so the ratio can move in
//! sub-sample steps without discontinuities. The target input rate lives
//! in an atomic cell: [`SyncerRateHandle::change_rate`] retunes the
//! converter from any thread while blocks are in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ring::RingProducer;
use crate::stats;

/// Hard bound on how far the effective rate may deviate from nominal
pub const MAX_RATE_OFFSET: f64 = 1e-3;

/// The ring would overflow; the caller must stop feeding until the ring
/// drains to half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrun;

/// Atomic cell holding the effective input sample rate in Hz
struct RateCell(AtomicU64);

impl RateCell {
    fn new(rate: f64) -> Self {
        Self(AtomicU64::new(rate.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }
}

/// Cloneable handle for retuning a [`Syncer`] from another thread
#[derive(Clone)]
pub struct SyncerRateHandle {
    cell: Arc<RateCell>,
    nominal_in_rate: f64,
}

impl SyncerRateHandle {
    /// Update the target input rate. Values outside the permitted band
    /// around nominal are clamped.
    pub fn change_rate(&self, new_in_rate: f64) {
        let lo = self.nominal_in_rate * (1.0 - MAX_RATE_OFFSET);
        let hi = self.nominal_in_rate * (1.0 + MAX_RATE_OFFSET);
        self.cell.store(new_in_rate.clamp(lo, hi));
    }

    pub fn nominal_in_rate(&self) -> f64 {
        self.nominal_in_rate
    }
}

pub struct Syncer {
    channels: usize,
    out_rate: f64,
    rate: Arc<RateCell>,
    nominal_in_rate: f64,
    producer: RingProducer,
    ring_len: usize,
    /// Interleaved frames not yet fully consumed by the interpolator
    work: Vec<f32>,
    /// Fractional read position into `work`, in frames
    pos: f64,
    out_buf: Vec<f32>,
    stalled: bool,
}

impl Syncer {
    /// Create the syncer and pre-fill the ring with half a ring of
    /// silence so the device can start before the first block lands.
    pub fn new(nominal_in_rate: f64, out_rate: f64, channels: usize, mut producer: RingProducer) -> Self {
        let ring_len = producer.capacity();
        producer.push_silence(ring_len / 2);
        Self {
            channels,
            out_rate,
            rate: Arc::new(RateCell::new(nominal_in_rate)),
            nominal_in_rate,
            producer,
            ring_len,
            work: Vec::new(),
            pos: 1.0,
            out_buf: Vec::new(),
            stalled: false,
        }
    }

    pub fn rate_handle(&self) -> SyncerRateHandle {
        SyncerRateHandle {
            cell: self.rate.clone(),
            nominal_in_rate: self.nominal_in_rate,
        }
    }

    /// Resample one block of interleaved samples into the ring.
    ///
    /// Returns [`Overrun`] when the ring cannot take the block. Once
    /// overrun, every call keeps failing (and dropping its input) until
    /// the consumer has drained the ring to half.
    pub fn enqueue(&mut self, samples: &[f32]) -> Result<(), Overrun> {
        debug_assert_eq!(samples.len() % self.channels, 0);

        if self.stalled {
            if self.producer.len() > self.ring_len / 2 {
                return Err(Overrun);
            }
            self.stalled = false;
        }

        let step = self.rate.load() / self.out_rate;
        stats::set_f64(&stats::registry().audio.sync_ratio, step);

        self.work.extend_from_slice(samples);
        self.resample(step);

        if self.out_buf.len() > self.producer.free_len() {
            stats::add_u32(&stats::registry().audio.buffer_overrun_count, 1);
            self.out_buf.clear();
            self.stalled = true;
            return Err(Overrun);
        }
        self.producer.push_slice(&self.out_buf);
        self.out_buf.clear();
        Ok(())
    }

    /// Current ring occupancy as seen from the producer side
    pub fn ring_fill(&self) -> usize {
        self.producer.len()
    }

    fn resample(&mut self, step: f64) {
        let ch = self.channels;
        let frames = self.work.len() / ch;

        // The cubic needs one frame behind and two ahead of the phase.
        while self.pos >= 1.0 && self.pos + 2.0 < frames as f64 {
            let i = self.pos as usize;
            let t = (self.pos - i as f64) as f32;
            for c in 0..ch {
                let p0 = self.work[(i - 1) * ch + c];
                let p1 = self.work[i * ch + c];
                let p2 = self.work[(i + 1) * ch + c];
                let p3 = self.work[(i + 2) * ch + c];
                self.out_buf.push(catmull_rom(p0, p1, p2, p3, t));
            }
            self.pos += step;
        }

        // Retire frames the interpolator can no longer reach.
        let keep_from = (self.pos as usize).saturating_sub(1);
        if keep_from > 0 {
            self.work.drain(..keep_from * ch);
            self.pos -= keep_from as f64;
        }
    }
}

#[inline]
fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * t3)
}

/// PI controller steering the syncer toward a half-full ring.
///
/// A slow task feeds it the filtered fill gauge the device callback
/// maintains; each update retunes the syncer's input rate within the
/// permitted band.
pub struct FillController {
    handle: SyncerRateHandle,
    target: f64,
    ring_len: f64,
    integral: f64,
}

/// Proportional gain on the normalised fill error
const KP: f64 = 0.02;
/// Integral gain per update
const KI: f64 = 0.002;

impl FillController {
    pub fn new(handle: SyncerRateHandle, ring_len: usize) -> Self {
        Self {
            handle,
            target: ring_len as f64 / 2.0,
            ring_len: ring_len as f64,
            integral: 0.0,
        }
    }

    /// One control step. Returns the input rate that was applied.
    pub fn update(&mut self, filtered_fill: f64) -> f64 {
        let error = (filtered_fill - self.target) / self.ring_len;
        self.integral = (self.integral + KI * error).clamp(-MAX_RATE_OFFSET, MAX_RATE_OFFSET);
        let steer = (KP * error + self.integral).clamp(-MAX_RATE_OFFSET, MAX_RATE_OFFSET);
        let rate = self.handle.nominal_in_rate() * (1.0 + steer);
        self.handle.change_rate(rate);
        rate
    }
}
