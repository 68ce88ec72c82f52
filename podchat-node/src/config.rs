//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordinator::CoordinatorOptions;

/// Node configuration. File: ~/.config/podchat/config.toml or /etc/podchat/config.toml.
/// Env overrides: PODCHAT_PORT, PODCHAT_HOST, PODCHAT_NAME.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Port shared by the whole peer set (default 9001).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fallback host address probed when no previous peer answers.
    #[serde(default)]
    pub host: Option<String>,
    /// Requested display name. None resolves to "Anonymous".
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
}

fn default_port() -> u16 {
    9001
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_ack_timeout_ms() -> u64 {
    1500
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_max_start_attempts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: None,
            name: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_start_attempts: default_max_start_attempts(),
        }
    }
}

impl Config {
    pub fn options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            port: self.port,
            host: self.host.clone(),
            name: self.name.clone(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_start_attempts: self.max_start_attempts,
        }
    }
}

/// Load config: merge default, then config file (explicit path, else the first
/// standard path present), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(p) => read_file(p),
        None => load_file(),
    }
    .unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PODCHAT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("PODCHAT_HOST") {
        if !s.is_empty() {
            c.host = Some(s);
        }
    }
    if let Some(s) = var("PODCHAT_NAME") {
        if !s.is_empty() {
            c.name = Some(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/podchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/podchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read_file(&path)
}

fn read_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}
