//! Lock-free SPSC sample ring
//!
//! Bridges the decode thread (producer) and the device callback
//! (consumer). One `f32` per slot, channels interleaved. Neither side
//! blocks or allocates after construction.
//!
//! The backing store is rounded up to a power of two; only the logical
//! capacity handed to [`SampleRing::new`] is ever visible to callers, and
//! the producer enforces it. Callers are expected to size-check
//! ([`RingProducer::free_len`] / [`RingConsumer::len`]) before bulk
//! operations; there is no error channel here, only short writes/reads.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Builder for the sample ring
pub struct SampleRing {
    rb: HeapRb<f32>,
    logical: usize,
}

impl SampleRing {
    /// Create a ring holding `logical` samples. The logical capacity must
    /// be a non-zero multiple of the interleaved channel count.
    pub fn new(logical: usize, channels: usize) -> Self {
        assert!(channels > 0, "channel count must be non-zero");
        assert!(
            logical > 0 && logical % channels == 0,
            "ring length must be a non-zero multiple of the channel count"
        );
        Self {
            rb: HeapRb::new(logical.next_power_of_two()),
            logical,
        }
    }

    /// Logical capacity in samples
    pub fn capacity(&self) -> usize {
        self.logical
    }

    /// Split into the producer and consumer halves
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let logical = self.logical;
        let (prod, cons) = self.rb.split();
        (
            RingProducer { prod, logical },
            RingConsumer { cons, logical },
        )
    }
}

/// Producer half, owned by the decode side
pub struct RingProducer {
    prod: HeapProd<f32>,
    logical: usize,
}

impl RingProducer {
    /// Logical capacity in samples
    pub fn capacity(&self) -> usize {
        self.logical
    }

    /// Snapshot of the current occupancy
    pub fn len(&self) -> usize {
        self.prod.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.prod.is_empty()
    }

    /// Samples that may be enqueued without exceeding the logical capacity
    pub fn free_len(&self) -> usize {
        self.logical.saturating_sub(self.prod.occupied_len())
    }

    /// Enqueue as many samples as fit logically; returns the count written
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.free_len());
        self.prod.push_slice(&samples[..n])
    }

    /// Enqueue `n` zero samples (startup pre-fill)
    pub fn push_silence(&mut self, n: usize) -> usize {
        let n = n.min(self.free_len());
        let mut written = 0;
        for _ in 0..n {
            if self.prod.try_push(0.0).is_err() {
                break;
            }
            written += 1;
        }
        written
    }
}

/// Consumer half, owned by the audio callback
pub struct RingConsumer {
    cons: HeapCons<f32>,
    logical: usize,
}

impl RingConsumer {
    /// Logical capacity in samples
    pub fn capacity(&self) -> usize {
        self.logical
    }

    /// Snapshot of the current occupancy
    pub fn len(&self) -> usize {
        self.cons.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.cons.is_empty()
    }

    /// Dequeue up to `out.len()` samples; returns the count read
    pub fn pop_slice(&mut self, out: &mut [f32]) -> usize {
        self.cons.pop_slice(out)
    }
}
