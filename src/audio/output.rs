//! Audio output bridge
//!
//! Runs the device callback that drains the sample ring. The callback
//! never blocks, locks or allocates: it pops what the ring has, writes
//! silence for any deficit, and publishes its observations through the
//! atomic stats registry.
//!
//! The cpal stream itself is owned by a dedicated thread (streams are
//! not `Send` on every backend); `start` performs a handshake with that
//! thread so device errors surface synchronously to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::bounded;
use tracing::{error, info};

use crate::audio::device::find_output_device;
use crate::constants::{BLOCK_TIMING_RING_LEN, STREAM_METER_BINS};
use crate::error::AudioError;
use crate::ring::RingConsumer;
use crate::stats;

/// Smoothing factor for the filtered fill gauge the syncer steers on
const FILL_EWMA_ALPHA: f64 = 0.02;

pub struct AudioOutput {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput {
    /// Open `device_name` (empty for the default device) and start the
    /// callback stream. Returns once the stream is actually playing.
    pub fn start(
        device_name: &str,
        sample_rate: u32,
        channels: u16,
        consumer: RingConsumer,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let device_name = device_name.to_string();

        let thread = thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || {
                let device = match find_output_device(&device_name) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Ok(name) = device.name() {
                    info!(device = %name, sample_rate, channels, "opening output device");
                }

                let config = StreamConfig {
                    channels,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: BufferSize::Default,
                };

                let mut callback = CallbackState::new(consumer);
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback.fill(data);
                    },
                    move |err| {
                        error!(error = %err, "output stream error");
                        stats::add_u32(&stats::registry().audio.audio_loop_xrun_count, 1);
                    },
                    None,
                );
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // The stream lives as long as this thread does.
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(50));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamError(
                    "output thread exited during startup".into(),
                ))
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the device callback
struct CallbackState {
    consumer: RingConsumer,
    epoch: Instant,
}

impl CallbackState {
    fn new(consumer: RingConsumer) -> Self {
        Self {
            consumer,
            epoch: Instant::now(),
        }
    }

    fn fill(&mut self, data: &mut [f32]) {
        let audio = &stats::registry().audio;

        let fill = self.consumer.len();
        audio.stream_buffer_pos.store(fill as u32, Ordering::Relaxed);

        // EWMA of the fill level, seeded on the first callback
        let previous = stats::get_f64(&audio.filtered_fill);
        let filtered = if previous == 0.0 {
            fill as f64
        } else {
            previous + FILL_EWMA_ALPHA * (fill as f64 - previous)
        };
        stats::set_f64(&audio.filtered_fill, filtered);

        // Fill-level histogram
        let capacity = self.consumer.capacity();
        let bin = (fill * STREAM_METER_BINS / (capacity + 1)).min(STREAM_METER_BINS - 1);
        stats::add_u32(&audio.stream_meter_bins[bin], 1);

        // Callback timing ring for jitter inspection
        let pos = audio.block_timing_ring_pos.load(Ordering::Relaxed) as usize;
        let next = (pos + 1) % BLOCK_TIMING_RING_LEN;
        let now_us = self.epoch.elapsed().as_micros() as u32;
        audio.block_timing_ring[next].store(now_us, Ordering::Relaxed);
        audio
            .block_timing_ring_pos
            .store(next as u32, Ordering::Relaxed);

        let popped = self.consumer.pop_slice(data);
        if popped < data.len() {
            data[popped..].fill(0.0);
            stats::add_u32(&audio.buffer_underrun_count, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::SampleRing;

    #[test]
    fn callback_drains_ring_and_pads_silence() {
        let _guard = stats::test_guard();
        stats::init();
        let (mut prod, cons) = SampleRing::new(64, 2).split();
        prod.push_slice(&[0.5; 6]);
        let mut state = CallbackState::new(cons);

        let mut out = [1.0f32; 10];
        state.fill(&mut out);
        assert_eq!(&out[..6], &[0.5; 6]);
        assert_eq!(&out[6..], &[0.0; 4]);

        let audio = &stats::registry().audio;
        assert_eq!(audio.buffer_underrun_count.load(Ordering::Relaxed), 1);
        assert_eq!(audio.stream_buffer_pos.load(Ordering::Relaxed), 6);
        assert_eq!(stats::get_f64(&audio.filtered_fill), 6.0);
    }

    #[test]
    fn exact_fill_is_not_an_underrun() {
        let _guard = stats::test_guard();
        stats::init();
        let (mut prod, cons) = SampleRing::new(64, 1).split();
        prod.push_slice(&[0.25; 8]);
        let mut state = CallbackState::new(cons);

        let mut out = [0.0f32; 8];
        state.fill(&mut out);
        assert_eq!(
            stats::registry()
                .audio
                .buffer_underrun_count
                .load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn filtered_fill_tracks_slowly() {
        let _guard = stats::test_guard();
        stats::init();
        let (mut prod, cons) = SampleRing::new(1024, 1).split();
        prod.push_slice(&[0.0; 512]);
        let mut state = CallbackState::new(cons);

        let mut out = [0.0f32; 32];
        state.fill(&mut out); // seeds at 512
        let audio = &stats::registry().audio;
        assert_eq!(stats::get_f64(&audio.filtered_fill), 512.0);

        state.fill(&mut out); // fill dropped to 480; EWMA moves a little
        let filtered = stats::get_f64(&audio.filtered_fill);
        assert!(filtered < 512.0 && filtered > 480.0, "filtered {filtered}");
    }
}
