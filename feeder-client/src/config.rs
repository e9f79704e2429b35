//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use feeder_core::DEFAULT_STREAM_PORT;

/// Client configuration. File: ~/.config/smartfeeder/config.toml or /etc/smartfeeder/config.toml.
/// Env overrides: SMARTFEEDER_STREAM_PORT, SMARTFEEDER_CONNECT_TIMEOUT, SMARTFEEDER_ACK_TIMEOUT,
/// SMARTFEEDER_PLAYER, SMARTFEEDER_SETTINGS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Used by `connect` when no address is given or saved.
    #[serde(default = "default_server_address")]
    pub default_server_address: String,
    /// RTMP port of the feeder server (default 1935).
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Player executable, invoked with the stream URL as its only argument.
    #[serde(default = "default_player_command")]
    pub player_command: String,
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_server_address() -> String {
    "192.168.2.41:5000".to_string()
}
fn default_stream_port() -> u16 {
    DEFAULT_STREAM_PORT
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_ack_timeout() -> u64 {
    10
}
fn default_http_timeout() -> u64 {
    30
}
fn default_player_command() -> String {
    "ffplay".to_string()
}
fn default_settings_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".config/smartfeeder/settings.toml"),
        None => PathBuf::from("smartfeeder-settings.toml"),
    }
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_server_address: default_server_address(),
            stream_port: default_stream_port(),
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            http_timeout_secs: default_http_timeout(),
            player_command: default_player_command(),
            settings_path: default_settings_path(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Apply env overrides from `var`. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("SMARTFEEDER_STREAM_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.stream_port = p;
            }
        }
        if let Some(s) = var("SMARTFEEDER_CONNECT_TIMEOUT") {
            if let Ok(t) = s.parse::<u64>() {
                self.connect_timeout_secs = t;
            }
        }
        if let Some(s) = var("SMARTFEEDER_ACK_TIMEOUT") {
            if let Ok(t) = s.parse::<u64>() {
                self.ack_timeout_secs = t;
            }
        }
        if let Some(s) = var("SMARTFEEDER_PLAYER") {
            if !s.trim().is_empty() {
                self.player_command = s;
            }
        }
        if let Some(s) = var("SMARTFEEDER_SETTINGS") {
            if !s.trim().is_empty() {
                self.settings_path = PathBuf::from(s);
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/smartfeeder/config.toml"));
    }
    out.push(PathBuf::from("/etc/smartfeeder/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring config file: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config file: {}", e),
            }
            break;
        }
    }
    None
}
