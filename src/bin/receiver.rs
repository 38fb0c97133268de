//! Receiver process
//!
//! Wires the full receive pipeline together: sample ring, decode
//! pipeline, demux channel, audio output, telemetry, clock-feedback
//! controller and finally the secure transport. Runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airlift::audio::{device::list_output_devices, AudioOutput};
use airlift::config::AppConfig;
use airlift::demux::{ChannelSpec, Demux};
use airlift::monitor::{self, MonitorContext};
use airlift::net::SecureTransport;
use airlift::pipeline::AudioPipeline;
use airlift::ring::SampleRing;
use airlift::stats;
use airlift::syncer::FillController;

/// Channel id the sender uses for the audio stream
const AUDIO_CHANNEL_ID: u8 = 1;

/// Cadence of the clock-feedback controller
const CONTROLLER_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "receiver.toml".into());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    tracing::info!(
        encoding = ?config.audio.encoding,
        channels = config.audio.channel_count,
        endpoints = config.endpoints.len(),
        "starting receiver"
    );
    for name in list_output_devices() {
        tracing::debug!(device = %name, "output device available");
    }

    stats::init();

    let channels = config.audio.channel_count as usize;
    let ring_len = config.decode_ring_length();
    let (producer, consumer) = SampleRing::new(ring_len, channels).split();

    let audio_pipeline =
        AudioPipeline::new(&config, producer).context("initializing decode pipeline")?;
    let rate_handle = audio_pipeline.rate_handle();

    let mut demux = Demux::new();
    demux.add_channel(
        ChannelSpec {
            ch_id: AUDIO_CHANNEL_ID,
            symbols_per_block: config.fec.source_symbols_per_block,
            symbol_len: config.fec.symbol_len,
        },
        Box::new(audio_pipeline),
    );
    let demux = Arc::new(demux);

    let mut output = AudioOutput::start(
        &config.audio.device_name,
        config.audio.io_sample_rate,
        config.audio.channel_count,
        consumer,
    )
    .context("starting audio output")?;

    if config.monitor.enabled {
        let context = MonitorContext::from_config(&config);
        tokio::spawn(async move {
            if let Err(e) = monitor::serve(context).await {
                tracing::error!(error = %e, "monitor server stopped");
            }
        });
    }

    // Clock feedback: steer the syncer toward a half-full ring using the
    // filtered fill gauge the device callback maintains.
    tokio::spawn(async move {
        let mut controller = FillController::new(rate_handle, ring_len);
        let mut ticker = tokio::time::interval(CONTROLLER_INTERVAL);
        loop {
            ticker.tick().await;
            let filtered_fill = stats::get_f64(&stats::registry().audio.filtered_fill);
            if filtered_fill > 0.0 {
                controller.update(filtered_fill);
            }
        }
    });

    let transport = SecureTransport::spawn(&config.endpoints, &config.keys, demux)
        .context("starting secure transport")?;

    tracing::info!("receiver running");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");

    transport.shutdown();
    output.stop();
    Ok(())
}
