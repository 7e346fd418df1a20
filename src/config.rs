use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::call::{MediaConstraints, VideoSize};
use crate::signal::ReconnectConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Frames larger than this are dropped by the relay.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Per-connection outbound queue; a recipient that overflows it is
    /// disconnected rather than allowed to stall the broadcast.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_audio")]
    pub audio: bool,
    #[serde(default = "default_video_size")]
    pub video_width: u32,
    #[serde(default = "default_video_size")]
    pub video_height: u32,
}

fn default_bind_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_send_queue() -> usize {
    64
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8081".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun1.l.google.com:19302".to_string()]
}

fn default_audio() -> bool {
    true
}

fn default_video_size() -> u32 {
    250
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_frame_bytes: default_max_frame_bytes(),
            send_queue: default_send_queue(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: default_audio(),
            video_width: default_video_size(),
            video_height: default_video_size(),
        }
    }
}

impl SignalConfig {
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

impl MediaConfig {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio,
            video: Some(VideoSize {
                width: self.video_width,
                height: self.video_height,
            }),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the huddle directory (~/.huddle)
pub fn get_huddle_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".huddle")
}

/// Get the config file path (~/.huddle/config.toml)
pub fn get_config_path() -> PathBuf {
    get_huddle_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.relay.bind_address, "127.0.0.1:8081");
        assert_eq!(config.relay.max_frame_bytes, 64 * 1024);
        assert_eq!(config.signal.url, "ws://127.0.0.1:8081");
        assert_eq!(config.signal.max_reconnect_attempts, 10);
        assert_eq!(config.media.video_width, 250);
        assert!(config.media.audio);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.relay.bind_address, config.relay.bind_address);
        assert_eq!(parsed.webrtc.stun_servers, config.webrtc.stun_servers);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[relay]\nbind_address = \"0.0.0.0:9000\"\n").unwrap();
        assert_eq!(parsed.relay.bind_address, "0.0.0.0:9000");
        assert_eq!(parsed.relay.send_queue, 64);
        assert_eq!(parsed.signal.reconnect_initial_ms, 500);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.relay.bind_address = "0.0.0.0:9000".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.relay.bind_address, "0.0.0.0:9000");
        assert_eq!(loaded.signal.url, config.signal.url);
    }

    #[test]
    fn test_load_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.relay.bind_address, "127.0.0.1:8081");
    }

    #[test]
    fn test_reconnect_conversion() {
        let signal = SignalConfig::default();
        let reconnect = signal.reconnect();
        assert_eq!(reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(reconnect.max_attempts, 10);
    }
}
