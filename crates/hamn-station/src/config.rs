// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Station configuration.
//!
//! Loaded by merging YAML layers from lowest to highest priority:
//! system-wide, XDG/home, workspace-local, then an explicit `--config`
//! path. Later layers override earlier ones; every field has a default so
//! an empty config starts a working single station.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use hamn_wire::Id;

use crate::error::StationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Base directory of the persistent layout.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Seed name of the station identity, fixed at first boot.
    #[serde(default = "default_station_name")]
    pub station_name: String,

    #[serde(default = "default_host")]
    pub station_host: String,
    #[serde(default = "default_port")]
    pub station_port: u16,
    /// WebSocket gate, same envelope JSON on a different port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Sibling stations this one bridges to.
    #[serde(default)]
    pub neighbors: Vec<NeighborConfig>,

    /// Well-known name → identity records of the address name service.
    #[serde(default)]
    pub ans_reserved_records: HashMap<String, Id>,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_s: u64,

    /// Envelopes per spool batch.
    #[serde(default = "default_batch_size")]
    pub offline_batch_size: usize,

    #[serde(default)]
    pub push_backend: PushBackendConfig,

    /// Identities returned by the `users` command.
    #[serde(default)]
    pub recommended_users: Vec<Id>,

    /// Per-sender envelope rate limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    #[serde(default = "default_rate_burst")]
    pub rate_limit_burst: u32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            station_name: default_station_name(),
            station_host: default_host(),
            station_port: default_port(),
            ws_port: default_ws_port(),
            neighbors: Vec::new(),
            ans_reserved_records: HashMap::new(),
            heartbeat_interval_s: default_heartbeat(),
            offline_batch_size: default_batch_size(),
            push_backend: PushBackendConfig::Log,
            recommended_users: Vec::new(),
            rate_limit_per_min: default_rate_limit(),
            rate_limit_burst: default_rate_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborConfig {
    pub id: Id,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushBackendConfig {
    /// Log-only notifications (the default).
    #[default]
    Log,
    /// POST a JSON summary to an HTTP endpoint.
    Webhook { url: String },
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("hamn"))
        .unwrap_or_else(|| PathBuf::from("./hamn-data"))
}

fn default_station_name() -> String {
    "gate".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9394
}

fn default_ws_port() -> u16 {
    9395
}

fn default_heartbeat() -> u64 {
    30
}

fn default_batch_size() -> usize {
    20
}

fn default_rate_limit() -> u32 {
    120
}

fn default_rate_burst() -> u32 {
    30
}

/// Ordered list of config locations, lowest to highest priority.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/hamn/station.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/hamn/station.yaml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("hamn/station.yaml"));
    }
    paths.push(PathBuf::from("station.yaml"));
    paths
}

/// Load configuration by merging all discovered YAML layers plus the
/// optional explicit path from `--config`.
pub fn load(extra: Option<&Path>) -> Result<StationConfig, StationError> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            merge_file(&mut merged, &path)?;
        }
    }
    if let Some(path) = extra {
        if !path.is_file() {
            return Err(StationError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        merge_file(&mut merged, path)?;
    }

    let config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        StationConfig::default()
    } else {
        serde_yaml::from_value(merged)
            .map_err(|e| StationError::Config(format!("invalid config: {e}")))?
    };
    Ok(config)
}

fn merge_file(merged: &mut serde_yaml::Value, path: &Path) -> Result<(), StationError> {
    debug!(path = %path.display(), "loading config layer");
    let text = std::fs::read_to_string(path)
        .map_err(|e| StationError::Config(format!("reading {}: {e}", path.display())))?;
    let layer: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| StationError::Config(format!("parsing {}: {e}", path.display())))?;
    merge_yaml(merged, layer);
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}
