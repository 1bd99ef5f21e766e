use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling relay
    #[serde(default = "default_signaling_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN servers for NAT traversal
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Label of the chat data channel created by the local endpoint
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:3001/signaling".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_channel_label() -> String {
    "chat".to_string()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl Config {
    /// Load config from ~/.peerchat/config.toml, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from a specific file, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the peerchat directory (~/.peerchat)
pub fn get_peerchat_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerchat")
}

/// Get the config file path (~/.peerchat/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerchat_dir().join("config.toml")
}
