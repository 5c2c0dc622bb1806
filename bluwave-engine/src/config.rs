//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Engine configuration. File: ~/.config/bluwave/config.toml or
/// /etc/bluwave/config.toml. Env overrides: BLUWAVE_NAME,
/// BLUWAVE_TRANSPORT_PORT, BLUWAVE_DISCOVERY_PORT, BLUWAVE_ENABLED.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Soft radio switch; commands fail with RadioDisabled when off.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Name shown to peers in handshake and discovery.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Chat transport TCP port (default 45760; 0 picks an ephemeral port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 45761).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// How long a scan listens for host announces, in seconds.
    #[serde(default = "default_scan_window_secs")]
    pub scan_window_secs: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_display_name() -> String {
    "BluWave Device".to_string()
}
fn default_transport_port() -> u16 {
    45760
}
fn default_discovery_port() -> u16 {
    45761
}
fn default_scan_window_secs() -> u64 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            display_name: default_display_name(),
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            scan_window_secs: default_scan_window_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("BLUWAVE_NAME") {
        if !s.is_empty() {
            c.display_name = s;
        }
    }
    if let Ok(s) = std::env::var("BLUWAVE_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("BLUWAVE_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("BLUWAVE_ENABLED") {
        if let Ok(b) = s.parse::<bool>() {
            c.enabled = b;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bluwave/config.toml"));
    }
    out.push(PathBuf::from("/etc/bluwave/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
