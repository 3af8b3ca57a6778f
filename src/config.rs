use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::models::SimmCapacity;

pub const CONFIG_PATH: &str = "/etc/simmctl/config.toml";
pub const ENV_PREFIX: &str = "SIMMCTL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub simm_capacity: SimmCapacity,
    pub verify_after_write: bool,
    /// How long the CLI waits for the programmer board to show up.
    pub connect_timeout_secs: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json: bool,
    pub simulator: SimulatorSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simm_capacity: SimmCapacity::default(),
            verify_after_write: true,
            connect_timeout_secs: 10,
            simulation: false,
            verbose: false,
            json: false,
            simulator: SimulatorSettings::default(),
        }
    }
}

/// Behaviour of the in-memory programmer board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    /// Pause between simulated protocol steps.
    pub step_delay_ms: u64,
    /// Bytes transferred per progress update.
    pub chunk_size: usize,
    /// Whether the board is attached as soon as monitoring starts.
    pub plugged_in: bool,
    /// Pin code pairs the electrical test reports as shorted.
    pub shorted_pins: Vec<[u8; 2]>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            step_delay_ms: 5,
            chunk_size: 64 * 1024,
            plugged_in: true,
            shorted_pins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `SIMMCTL_*` environment variables and
    /// finally `overrides` (usually the parsed command line).
    ///
    /// A missing config file is not an error. Without `config_path` the
    /// system-wide file at [`CONFIG_PATH`] is used.
    pub fn new<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let path = config_path.unwrap_or_else(|| Path::new(CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write this configuration as TOML, creating parent directories as needed.
    pub fn write_to(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(path.to_path_buf())
    }
}
