//! BidCore Settings

use serde::{Deserialize, Serialize};

/// Complete settings for the auction core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BidCoreSettings {
    pub gateway: GatewaySettings,
    pub cross_node_bus: CrossNodeBusSettings,
    pub timer: TimerSettings,
    pub replay: ReplaySettings,
    pub state_cache: StateCacheSettings,
}

impl BidCoreSettings {
    /// Parse settings from a TOML document; absent keys take defaults.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Push channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Origins allowed to open a session; empty list allows any origin.
    pub allowed_origins: Vec<String>,
    /// Prefix applied when masking bidder ids on public payloads.
    pub mask_prefix: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            mask_prefix: "***-".to_string(),
        }
    }
}

/// Redis connection settings for the cross-node bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossNodeBusSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl CrossNodeBusSettings {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for CrossNodeBusSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

/// Auction timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub tick_ms: u64,
    pub ending_threshold_ms: i64,
    pub anti_snipe_window_ms: i64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            ending_threshold_ms: 60_000,
            anti_snipe_window_ms: 30_000,
        }
    }
}

/// Replay buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    pub max_events: usize,
    pub window_ms: i64,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            max_events: 50,
            window_ms: 300_000,
        }
    }
}

/// Auction state cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateCacheSettings {
    pub ttl_ms: u64,
}

impl Default for StateCacheSettings {
    fn default() -> Self {
        Self { ttl_ms: 5_000 }
    }
}
