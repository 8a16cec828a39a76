// ============================
// bingo-lib/src/config.rs
// ============================
//! Configuration management.
//!
//! Settings are layered: built-in defaults, then `bingo.toml`, then
//! environment variables prefixed `BINGO_` (nested keys split on `__`, so
//! `BINGO_DRAW__STEPS=5` sets `draw.steps`).
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Relay bind address
    pub bind_addr: SocketAddr,
    /// Data directory for room snapshots, call logs and device profiles
    pub data_dir: PathBuf,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON log lines
    pub log_json: bool,
    /// Relay URL clients connect to
    pub server_url: String,
    /// Per-connection outbound queue length
    pub channel_capacity: usize,
    pub draw: DrawSettings,
    pub presence: PresenceSettings,
    pub session: SessionSettings,
    pub store: StoreSettings,
}

/// Draw animation timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawSettings {
    /// Frames per draw, the last one commits
    pub steps: u32,
    pub step_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// How long a departed player's name stays listed
    pub departure_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Fixed wait before a dropped link is reopened
    pub reconnect_delay_ms: u64,
    /// Websocket handshake limit
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Upper bound on any single call to the room store
    pub timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_json: false,
            server_url: "http://127.0.0.1:3000".to_string(),
            channel_capacity: 64,
            draw: DrawSettings::default(),
            presence: PresenceSettings::default(),
            session: SessionSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl Default for DrawSettings {
    fn default() -> Self {
        Self {
            steps: 10,
            step_interval_ms: 60,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            departure_grace_ms: 3000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2000,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { timeout_ms: 3000 }
    }
}

impl DrawSettings {
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }
}

impl PresenceSettings {
    pub fn departure_grace(&self) -> Duration {
        Duration::from_millis(self.departure_grace_ms)
    }
}

impl SessionSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl StoreSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// The provider stack: defaults, `path`, then `BINGO_*` env vars.
    pub fn figment_from(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BINGO_").split("__"))
    }

    /// Load from `bingo.toml` in the working directory
    pub fn load() -> Result<Self> {
        Self::load_from("bingo.toml")
    }

    /// Load from an explicit config file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = Self::figment_from(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            bail!("invalid log level: {}", self.log_level);
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be at least 1");
        }
        if self.store.timeout_ms == 0 {
            bail!("store.timeout_ms must be at least 1");
        }
        if self.session.connect_timeout_ms == 0 {
            bail!("session.connect_timeout_ms must be at least 1");
        }
        if self.draw.steps == 0 {
            bail!("draw.steps must be at least 1");
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            bail!("server_url must be an http(s) URL: {}", self.server_url);
        }
        Ok(())
    }

    /// Websocket endpoint derived from `server_url`
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or_else(|| base.to_string());
        format!("{base}/ws")
    }
}
