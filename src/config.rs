//! Client Configuration
//!
//! Defines the configuration for the miner including:
//! - Coordinator endpoints (api, data, registry, notebook gateway)
//! - Per-device bid rate, RAM and disk advertisements
//! - Optional cryptominer command per device
//!
//! Values come from the `.emrys` TOML file (home, `~/.config/emrys`, then
//! the working directory) and are overridden by CLI flags and `EMRYS_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name of the config file looked up in each search directory
pub const CONFIG_FILE_NAME: &str = ".emrys";

/// First loopback port handed to notebook containers
pub const DEFAULT_NOTEBOOK_BASE_PORT: u16 = 8900;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} has {got} values, expected 1 or {expected} (one per device)")]
    ArrayLength {
        name: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("{name} is required")]
    Missing { name: &'static str },
    #[error("invalid size {0:?}, expected e.g. 8gb, 512mb or a byte count")]
    InvalidSize(String),
    #[error("invalid bid rate {0}, must be positive")]
    InvalidRate(f64),
    #[error("device {0} is not present on this machine")]
    UnknownDevice(u32),
    #[error("no GPU devices found")]
    NoDevices,
    #[error("notebook base port {base} leaves no room for {devices} devices")]
    PortRange { base: u16, devices: usize },
    #[error("failed to read config file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Hosts of the coordinator services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Base URL of the API host
    pub api: String,
    /// Base URL of the data host
    pub data: String,
    /// Registry host name (no scheme), used in image references
    pub registry: String,
    /// Notebook gateway host for ssh reverse forwards
    pub notebook: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api: "https://api.emrys.io".to_string(),
            data: "https://data.emrys.io".to_string(),
            registry: "registry.emrys.io".to_string(),
            notebook: "notebook.emrys.io".to_string(),
        }
    }
}

impl Endpoints {
    /// Every service behind one base URL (local testing).
    pub fn single(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        let host = base
            .split("://")
            .nth(1)
            .unwrap_or(base.as_str())
            .to_string();
        Self {
            api: base.clone(),
            data: base,
            registry: host.clone(),
            notebook: host,
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api.trim_end_matches('/'), path)
    }

    pub fn data_url(&self, path: &str) -> String {
        format!("{}{}", self.data.trim_end_matches('/'), path)
    }

    /// `<registry>/miner/<job-id>:latest`
    pub fn job_image(&self, job_id: &str) -> String {
        format!("{}/miner/{}:latest", self.registry, job_id)
    }
}

/// Contents of an `.emrys` file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    pub devices: Option<Vec<u32>>,
    pub bid_rates: Option<Vec<f64>>,
    pub ram: Option<Vec<String>>,
    pub disk: Option<Vec<String>>,
    pub mining_command: Option<Vec<String>>,
    pub notebook_base_port: Option<u16>,
    pub api_url: Option<String>,
    pub data_url: Option<String>,
    pub registry: Option<String>,
    pub notebook_host: Option<String>,
}

impl FileConfig {
    /// Parse a config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the first `.emrys` found in `search_dirs`, or defaults.
    pub fn discover(search_dirs: &[PathBuf]) -> Result<Self, ConfigError> {
        for dir in search_dirs {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                debug!("Using config file {}", candidate.display());
                return Self::from_path(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Home, `~/.config/emrys`, then the working directory.
    pub fn default_search_dirs() -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(home) = crate::state::home_dir() {
            dirs.push(home.clone());
            dirs.push(home.join(".config").join("emrys"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        dirs
    }

    /// Layer `top` over `self`; values set in `top` win.
    pub fn overlay(self, top: FileConfig) -> FileConfig {
        FileConfig {
            devices: top.devices.or(self.devices),
            bid_rates: top.bid_rates.or(self.bid_rates),
            ram: top.ram.or(self.ram),
            disk: top.disk.or(self.disk),
            mining_command: top.mining_command.or(self.mining_command),
            notebook_base_port: top.notebook_base_port.or(self.notebook_base_port),
            api_url: top.api_url.or(self.api_url),
            data_url: top.data_url.or(self.data_url),
            registry: top.registry.or(self.registry),
            notebook_host: top.notebook_host.or(self.notebook_host),
        }
    }

    pub fn miner_config(&self) -> MinerConfig {
        MinerConfig {
            devices: self.devices.clone(),
            bid_rates: self.bid_rates.clone().unwrap_or_default(),
            ram: self.ram.clone().unwrap_or_default(),
            disk: self.disk.clone().unwrap_or_default(),
            mining_commands: self.mining_command.clone().unwrap_or_default(),
            notebook_base_port: self
                .notebook_base_port
                .unwrap_or(DEFAULT_NOTEBOOK_BASE_PORT),
            endpoints: self.endpoints(),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        let defaults = Endpoints::default();
        Endpoints {
            api: self.api_url.clone().unwrap_or(defaults.api),
            data: self.data_url.clone().unwrap_or(defaults.data),
            registry: self.registry.clone().unwrap_or(defaults.registry),
            notebook: self.notebook_host.clone().unwrap_or(defaults.notebook),
        }
    }
}

/// Parse a size such as `8gb`, `512MB` or `1000` into bytes (decimal units).
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let s = input.trim().to_lowercase();
    let invalid = || ConfigError::InvalidSize(input.to_string());

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        _ => return Err(invalid()),
    };

    if number < 0.0 || !number.is_finite() {
        return Err(invalid());
    }
    Ok((number * multiplier as f64).round() as u64)
}

/// Expand a per-device array: length 1 broadcasts, length `n` maps by
/// position, anything else is an error.
pub fn broadcast<T: Clone>(
    name: &'static str,
    values: &[T],
    n: usize,
) -> Result<Vec<T>, ConfigError> {
    match values.len() {
        0 => Err(ConfigError::Missing { name }),
        1 => Ok(vec![values[0].clone(); n]),
        len if len == n => Ok(values.to_vec()),
        got => Err(ConfigError::ArrayLength {
            name,
            got,
            expected: n,
        }),
    }
}

/// Miner settings after merging file, environment and flags
#[derive(Debug, Clone, Default)]
pub struct MinerConfig {
    /// Explicit device indices; `None` means every detected device
    pub devices: Option<Vec<u32>>,
    pub bid_rates: Vec<f64>,
    pub ram: Vec<String>,
    pub disk: Vec<String>,
    pub mining_commands: Vec<String>,
    pub notebook_base_port: u16,
    pub endpoints: Endpoints,
}

/// Fully resolved settings for one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub index: u32,
    pub bid_rate: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
    pub mining_command: String,
    pub notebook_port: u16,
}

impl MinerConfig {
    /// Match the device list with the per-device arrays.
    pub fn resolve(&self, detected: &[u32]) -> Result<Vec<DeviceConfig>, ConfigError> {
        let devices = match &self.devices {
            Some(explicit) => {
                for d in explicit {
                    if !detected.contains(d) {
                        return Err(ConfigError::UnknownDevice(*d));
                    }
                }
                explicit.clone()
            }
            None => detected.to_vec(),
        };
        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let n = devices.len();

        let rates = broadcast("bid-rates", &self.bid_rates, n)?;
        if let Some(bad) = rates.iter().find(|r| !(**r > 0.0)) {
            return Err(ConfigError::InvalidRate(*bad));
        }
        let ram = broadcast("ram", &self.ram, n)?
            .iter()
            .map(|s| parse_size(s))
            .collect::<Result<Vec<_>, _>>()?;
        let disk = broadcast("disk", &self.disk, n)?
            .iter()
            .map(|s| parse_size(s))
            .collect::<Result<Vec<_>, _>>()?;
        let commands = if self.mining_commands.is_empty() {
            vec![String::new(); n]
        } else {
            broadcast("mining-command", &self.mining_commands, n)?
        };

        devices
            .into_iter()
            .enumerate()
            .map(|(i, index)| {
                let notebook_port = u16::try_from(i)
                    .ok()
                    .and_then(|i| self.notebook_base_port.checked_add(i))
                    .ok_or(ConfigError::PortRange {
                        base: self.notebook_base_port,
                        devices: n,
                    })?;
                Ok(DeviceConfig {
                    index,
                    bid_rate: rates[i],
                    ram_bytes: ram[i],
                    disk_bytes: disk[i],
                    mining_command: commands[i].clone(),
                    notebook_port,
                })
            })
            .collect()
    }
}
