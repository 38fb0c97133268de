//! Receiver configuration
//!
//! All tunables live in one TOML file. Every section has defaults so a
//! minimal config only needs the key material and endpoint list.

use serde::Deserialize;
use std::path::Path;

use crate::constants::{MAX_AUDIO_CHANNELS, MAX_ENDPOINTS, OPUS_SAMPLE_RATE};
use crate::error::{Error, NetworkError, Result};

/// Audio payload encoding carried inside the FEC blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Opus,
    Pcm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub encoding: Encoding,
    /// Interleaved channels carried on the network stream
    pub channel_count: u16,
    /// Sample rate of the local output device
    pub io_sample_rate: u32,
    /// Output device name; empty selects the default device
    pub device_name: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Opus,
            channel_count: 2,
            io_sample_rate: 48_000,
            device_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    /// Samples per channel in one codec packet
    pub frame_size: usize,
    /// Largest encoded packet the framer will accept
    pub max_packet_size: usize,
    /// Logical sample ring length (must be a multiple of channel_count)
    pub decode_ring_length: usize,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            frame_size: 240,
            max_packet_size: 1024,
            decode_ring_length: 8192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PcmConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub decode_ring_length: usize,
}

impl Default for PcmConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_size: 240,
            decode_ring_length: 8192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// K: source symbols per block
    pub source_symbols_per_block: usize,
    /// L: bytes per symbol
    pub symbol_len: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            source_symbols_per_block: 4,
            symbol_len: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Local interface this path binds to (e.g. "eth0")
    pub interface: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    26_841
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyConfig {
    /// Base64-encoded local X25519 private key
    pub private_key: String,
    /// Base64-encoded sender X25519 public key
    pub peer_public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub ws_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_port: 26_900,
        }
    }
}

/// Top-level receiver configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub opus: OpusConfig,
    pub pcm: PcmConfig,
    pub fec: FecConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub keys: KeyConfig,
    pub monitor: MonitorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            opus: OpusConfig::default(),
            pcm: PcmConfig::default(),
            fec: FecConfig::default(),
            endpoints: Vec::new(),
            keys: KeyConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Sample rate of the incoming stream for the active encoding
    pub fn encoded_sample_rate(&self) -> u32 {
        match self.audio.encoding {
            Encoding::Opus => OPUS_SAMPLE_RATE,
            Encoding::Pcm => self.pcm.sample_rate,
        }
    }

    /// Samples per channel in one codec packet for the active encoding
    pub fn frame_size(&self) -> usize {
        match self.audio.encoding {
            Encoding::Opus => self.opus.frame_size,
            Encoding::Pcm => self.pcm.frame_size,
        }
    }

    /// Logical sample ring length for the active encoding
    pub fn decode_ring_length(&self) -> usize {
        match self.audio.encoding {
            Encoding::Opus => self.opus.decode_ring_length,
            Encoding::Pcm => self.pcm.decode_ring_length,
        }
    }

    /// Largest encoded packet for the active encoding. PCM packets have a
    /// fixed wire size: 3 bytes per sample plus the CRC-16 trailer.
    pub fn max_packet_size(&self) -> usize {
        match self.audio.encoding {
            Encoding::Opus => self.opus.max_packet_size,
            Encoding::Pcm => 3 * self.pcm.frame_size * self.audio.channel_count as usize + 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(NetworkError::NoEndpoints.into());
        }
        if self.endpoints.len() > MAX_ENDPOINTS {
            return Err(Error::Config(format!(
                "too many endpoints: {} (max {MAX_ENDPOINTS})",
                self.endpoints.len()
            )));
        }
        let channels = self.audio.channel_count as usize;
        if channels == 0 || channels > MAX_AUDIO_CHANNELS {
            return Err(Error::Config(format!(
                "channel_count must be 1..={MAX_AUDIO_CHANNELS}, got {channels}"
            )));
        }
        if self.audio.encoding == Encoding::Opus && channels > 2 {
            return Err(Error::Config(format!(
                "opus decoding supports at most 2 channels, got {channels}"
            )));
        }
        let ring_len = self.decode_ring_length();
        if ring_len == 0 || ring_len % channels != 0 {
            return Err(Error::Config(format!(
                "decode_ring_length {ring_len} must be a non-zero multiple of channel_count {channels}"
            )));
        }
        if self.fec.source_symbols_per_block == 0 || self.fec.symbol_len == 0 {
            return Err(Error::Config(
                "fec.source_symbols_per_block and fec.symbol_len must be non-zero".into(),
            ));
        }
        if self.fec.symbol_len > u16::MAX as usize {
            return Err(Error::Config(format!(
                "fec.symbol_len {} exceeds the 16-bit symbol limit",
                self.fec.symbol_len
            )));
        }
        if self.frame_size() == 0 {
            return Err(Error::Config("frame_size must be non-zero".into()));
        }
        decode_x25519_key(&self.keys.private_key)?;
        decode_x25519_key(&self.keys.peer_public_key)?;
        Ok(())
    }
}

/// Decode a base64 X25519 key into its 32 raw bytes
pub fn decode_x25519_key(encoded: &str) -> Result<[u8; 32]> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| NetworkError::KeyFormat(format!("invalid base64: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| NetworkError::KeyFormat("key must decode to 32 bytes".into()))?;
    Ok(key)
}
