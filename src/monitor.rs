//! WebSocket telemetry
//!
//! Serves pipeline statistics to a dashboard client: one WebSocket
//! endpoint, one JSON snapshot every 50 ms. Strictly read-only against
//! the stats registry; a slow or absent client never touches the
//! pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AppConfig, Encoding};
use crate::constants::{BLOCK_TIMING_RING_LEN, STREAM_METER_BINS};
use crate::error::Result;
use crate::stats;

/// Snapshot cadence (~20 Hz)
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(50);

/// Static facts the snapshots are annotated with
pub struct MonitorContext {
    pub ws_port: u16,
    pub encoding: Encoding,
    pub channel_count: usize,
    pub endpoint_count: usize,
    pub interfaces: Vec<String>,
}

impl MonitorContext {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ws_port: config.monitor.ws_port,
            encoding: config.audio.encoding,
            channel_count: config.audio.channel_count as usize,
            endpoint_count: config.endpoints.len(),
            interfaces: config
                .endpoints
                .iter()
                .map(|ep| ep.interface.clone())
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct AudioChannelSnapshot {
    clipping_count: u32,
    level_fast: f64,
    level_slow: f64,
}

#[derive(Serialize)]
struct EndpointSnapshot {
    interface: String,
    open: u32,
    bytes_in: u64,
    bytes_out: u64,
    send_congestion: u32,
    last_relative_sbn: i32,
}

#[derive(Serialize)]
struct AudioSnapshot {
    stream_buffer_pos: u32,
    filtered_fill: f64,
    receiver_sync: f64,
    buffer_underrun_count: u32,
    buffer_overrun_count: u32,
    audio_loop_xrun_count: u32,
    stream_meter_bins: Vec<u8>,
    channels: Vec<AudioChannelSnapshot>,
    codec_error_count: Option<u32>,
    crc_fail_count: Option<u32>,
}

#[derive(Serialize)]
struct Snapshot {
    dup_block_count: u32,
    ooo_block_count: u32,
    last_block_sbn_diff: i32,
    block_timing: Vec<u32>,
    audio: AudioSnapshot,
    endpoints: Vec<EndpointSnapshot>,
}

/// Run the monitor server until the process exits
pub async fn serve(context: MonitorContext) -> Result<()> {
    let port = context.ws_port;
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::new(context));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "monitor listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<Arc<MonitorContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stats_stream(socket, context))
}

async fn stats_stream(mut socket: WebSocket, context: Arc<MonitorContext>) {
    debug!("monitor client connected");
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        ticker.tick().await;
        let snapshot = build_snapshot(&context);
        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "snapshot serialization failed");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            debug!("monitor client disconnected");
            return;
        }
    }
}

fn build_snapshot(context: &MonitorContext) -> Snapshot {
    let registry = stats::registry();
    let channel = &registry.channel;
    let audio = &registry.audio;
    let codec = &registry.codec;

    let raw_bins: Vec<u32> = audio
        .stream_meter_bins
        .iter()
        .map(|bin| bin.load(Ordering::Relaxed))
        .collect();

    let last_sbns: Vec<i32> = (0..context.endpoint_count)
        .map(|i| channel.last_sbn[i].load(Ordering::Relaxed))
        .collect();

    let endpoints = (0..context.endpoint_count)
        .map(|i| {
            let ep = &registry.endpoints[i];
            EndpointSnapshot {
                interface: context.interfaces[i].clone(),
                open: ep.open.load(Ordering::Relaxed),
                bytes_in: ep.bytes_in.load(Ordering::Relaxed),
                bytes_out: ep.bytes_out.load(Ordering::Relaxed),
                send_congestion: ep.send_congestion.load(Ordering::Relaxed),
                last_relative_sbn: relative_sbn(&last_sbns, i),
            }
        })
        .collect();

    let channels = (0..context.channel_count.min(crate::constants::MAX_AUDIO_CHANNELS))
        .map(|ch| AudioChannelSnapshot {
            clipping_count: audio.clipping_counts[ch].load(Ordering::Relaxed),
            level_fast: stats::get_f64(&audio.levels_fast[ch]),
            level_slow: stats::get_f64(&audio.levels_slow[ch]),
        })
        .collect();

    let (codec_error_count, crc_fail_count) = match context.encoding {
        Encoding::Opus => (Some(codec.codec_error_count.load(Ordering::Relaxed)), None),
        Encoding::Pcm => (None, Some(codec.crc_fail_count.load(Ordering::Relaxed))),
    };

    Snapshot {
        dup_block_count: channel.dup_block_count.load(Ordering::Relaxed),
        ooo_block_count: channel.ooo_block_count.load(Ordering::Relaxed),
        last_block_sbn_diff: channel.last_block_sbn_diff.load(Ordering::Relaxed),
        block_timing: flatten_timing_ring(
            &audio
                .block_timing_ring
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed))
                .collect::<Vec<_>>(),
            audio.block_timing_ring_pos.load(Ordering::Relaxed) as usize,
        ),
        audio: AudioSnapshot {
            stream_buffer_pos: audio.stream_buffer_pos.load(Ordering::Relaxed),
            filtered_fill: stats::get_f64(&audio.filtered_fill),
            receiver_sync: stats::get_f64(&audio.sync_ratio),
            buffer_underrun_count: audio.buffer_underrun_count.load(Ordering::Relaxed),
            buffer_overrun_count: audio.buffer_overrun_count.load(Ordering::Relaxed),
            audio_loop_xrun_count: audio.audio_loop_xrun_count.load(Ordering::Relaxed),
            stream_meter_bins: map_meter_bins(&raw_bins),
            channels,
            codec_error_count,
            crc_fail_count,
        },
        endpoints,
    }
}

/// SBN of endpoint `i` relative to endpoint 0, recentred into [-128, 127]
fn relative_sbn(last_sbns: &[i32], i: usize) -> i32 {
    let mut rel = last_sbns[i] - last_sbns[0];
    if rel > 127 {
        rel -= 256;
    }
    if rel < -128 {
        rel += 256;
    }
    rel
}

/// Map raw histogram counts onto 0..=255 for heatmap display. Bins with
/// a non-zero count always map to at least 1.
fn map_meter_bins(raw: &[u32]) -> Vec<u8> {
    debug_assert_eq!(raw.len(), STREAM_METER_BINS);
    let max = raw.iter().copied().max().unwrap_or(0);
    let min = raw
        .iter()
        .copied()
        .filter(|&v| v > 0)
        .min()
        .unwrap_or(0);
    if max == min {
        // No dynamic range, typically an all-zero histogram
        return vec![0; raw.len()];
    }
    raw.iter()
        .map(|&v| {
            if v < min {
                0
            } else {
                let mapped = (255 * (v - min) / (max - min)) as u8;
                mapped.max(1)
            }
        })
        .collect()
}

/// Flatten the timing ring oldest-first, excluding the write head
fn flatten_timing_ring(ring: &[u32], write_pos: usize) -> Vec<u32> {
    debug_assert_eq!(ring.len(), BLOCK_TIMING_RING_LEN);
    let mut pos = (write_pos + 1) % ring.len();
    let mut out = Vec::with_capacity(ring.len() - 1);
    for _ in 0..ring.len() - 1 {
        out.push(ring[pos]);
        pos = (pos + 1) % ring.len();
    }
    out
}
