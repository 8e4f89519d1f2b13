// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::announce::FeeTier;
use crate::engine::EngineConfig;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Networking
    pub listen_port: u16,
    /// Address published with announcements. Defaults to loopback on
    /// `listen_port`.
    pub advertise_addr: Option<String>,

    // Disk
    pub download_folder: Option<PathBuf>,

    // Transfers
    pub max_requests_per_peer: usize,

    // Timings
    pub chunk_receive_timeout_secs: u64,
    pub session_dial_timeout_secs: u64,
    pub session_stale_timeout_secs: u64,
    pub scheduler_tick_ms: u64,
    pub redial_interval_secs: u64,
    pub status_interval_secs: u64,

    // Announcements
    pub transaction_fee: FeeTier,
    pub default_topic: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 7648,
            advertise_addr: None,
            download_folder: None,
            max_requests_per_peer: 8,
            chunk_receive_timeout_secs: 120,
            session_dial_timeout_secs: 60,
            session_stale_timeout_secs: 60,
            scheduler_tick_ms: 500,
            redial_interval_secs: 10,
            status_interval_secs: 5,
            transaction_fee: FeeTier::default(),
            default_topic: "swarmseed-public".to_string(),
        }
    }
}

impl Settings {
    /// Runtime engine settings. `data_dir` supplies the download folder when
    /// none is configured.
    pub fn engine_config(&self, data_dir: &Path) -> EngineConfig {
        EngineConfig {
            download_folder: self
                .download_folder
                .clone()
                .unwrap_or_else(|| data_dir.join("downloads")),
            advertise_addr: self
                .advertise_addr
                .clone()
                .unwrap_or_else(|| format!("127.0.0.1:{}", self.listen_port)),
            default_topic: self.default_topic.clone(),
            max_requests_per_peer: self.max_requests_per_peer.max(1),
            chunk_receive_timeout: Duration::from_secs(self.chunk_receive_timeout_secs),
            session_dial_timeout: Duration::from_secs(self.session_dial_timeout_secs),
            session_stale_timeout: Duration::from_secs(self.session_stale_timeout_secs),
            scheduler_tick: Duration::from_millis(self.scheduler_tick_ms.max(1)),
            redial_interval: Duration::from_secs(self.redial_interval_secs),
            fee_tier: self.transaction_fee,
        }
    }
}

/// Config and data directories, created if needed.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("com", "github", "swarmseed")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_local_dir().to_path_buf();

    fs::create_dir_all(&config_dir).ok()?;
    fs::create_dir_all(&data_dir).ok()?;

    Some((config_dir, data_dir))
}

fn settings_figment(config_file: &Path) -> Figment {
    Figment::new()
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("SWARMSEED_"))
}

pub fn load_settings() -> Settings {
    if let Some((config_dir, _)) = get_app_paths() {
        return settings_figment(&config_dir.join("settings.toml"))
            .extract()
            .unwrap_or_default();
    }

    Settings::default()
}

/// Writes the defaults on first run so there is a file to edit. Returns
/// whether a file was written.
pub fn save_default_settings() -> io::Result<bool> {
    match get_app_paths() {
        Some((config_dir, _)) => save_default_settings_to(&config_dir),
        None => Ok(false),
    }
}

fn save_default_settings_to(config_dir: &Path) -> io::Result<bool> {
    if config_dir.join("settings.toml").exists() {
        return Ok(false);
    }
    save_settings_to(&Settings::default(), config_dir)?;
    Ok(true)
}

fn save_settings_to(settings: &Settings, config_dir: &Path) -> io::Result<()> {
    let config_file_path = config_dir.join("settings.toml");
    let temp_file_path = config_dir.join("settings.toml.tmp");
    let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
    fs::write(&temp_file_path, content)?;
    fs::rename(&temp_file_path, &config_file_path)
}
