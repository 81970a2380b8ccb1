//! Simulator Configuration
//!
//! ```toml
//! [bus]
//! name = "boot"
//! log_level = "debug"
//!
//! [[disk]]
//! name = "hd0"
//! media = "hard"
//! sectors = 2048
//!
//! [probe]
//! image = "lowmem.bin"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

use crate::disk::{Media, RamDisk};

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub name: String,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub name: String,
    pub media: Media,
    pub sectors: u64,
    #[serde(default)]
    pub sector_size: Option<u32>,
}

impl DiskConfig {
    pub fn sector_size(&self) -> u32 {
        self.sector_size
            .unwrap_or_else(|| self.media.default_sector_size())
    }

    pub fn build(&self) -> RamDisk {
        RamDisk::new(&self.name, self.media, self.sectors).with_sector_size(self.sector_size())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    pub image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Level from `[bus] log_level`, if set
    pub fn log_level(&self) -> Result<Option<LevelFilter>, ConfigError> {
        self.bus
            .log_level
            .as_deref()
            .map(|level| {
                level
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", level)))
            })
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.name.trim().is_empty() {
            return Err(ConfigError::Invalid("bus name is empty".into()));
        }
        self.log_level()?;
        for disk in &self.disks {
            if disk.name.is_empty() {
                return Err(ConfigError::Invalid("disk name is empty".into()));
            }
            if disk.sectors == 0 {
                return Err(ConfigError::Invalid(format!("disk '{}' has no sectors", disk.name)));
            }
            let size = disk.sector_size();
            if size == 0 || !size.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "disk '{}' has bad sector size {}",
                    disk.name, size
                )));
            }
        }
        Ok(())
    }
}

impl core::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
