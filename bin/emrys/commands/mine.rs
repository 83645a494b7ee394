//! `emrys mine`

use super::load_config;
use crate::style::*;
use anyhow::Result;
use clap::Args;
use emrys::{supervisor, FileConfig, TokenStore};

/// Flags given once apply to every device; otherwise one value per device.
#[derive(Args, Debug, Default)]
pub struct MineArgs {
    /// GPU indices to expose (default: every detected GPU)
    #[arg(long, env = "EMRYS_DEVICES", value_delimiter = ',')]
    pub devices: Vec<u32>,

    /// Minimum hourly rate in USD
    #[arg(long, env = "EMRYS_BID_RATES", value_delimiter = ',')]
    pub bid_rates: Vec<f64>,

    /// RAM per device, e.g. 8gb
    #[arg(long, env = "EMRYS_RAM", value_delimiter = ',')]
    pub ram: Vec<String>,

    /// Disk per device, e.g. 25gb
    #[arg(long, env = "EMRYS_DISK", value_delimiter = ',')]
    pub disk: Vec<String>,

    /// Command mining on a GPU between jobs
    #[arg(long, env = "EMRYS_MINING_COMMAND", value_delimiter = ',')]
    pub mining_command: Vec<String>,

    /// First host port for notebook jobs; the i-th selected device uses base + i
    #[arg(long, env = "EMRYS_NOTEBOOK_BASE_PORT")]
    pub notebook_base_port: Option<u16>,

    #[arg(long, env = "EMRYS_API_URL", hide = true)]
    pub api_url: Option<String>,

    #[arg(long, env = "EMRYS_DATA_URL", hide = true)]
    pub data_url: Option<String>,

    #[arg(long, env = "EMRYS_REGISTRY", hide = true)]
    pub registry: Option<String>,

    #[arg(long, env = "EMRYS_NOTEBOOK_HOST", hide = true)]
    pub notebook_host: Option<String>,
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

impl MineArgs {
    pub fn into_file_config(self) -> FileConfig {
        FileConfig {
            devices: non_empty(self.devices),
            bid_rates: non_empty(self.bid_rates),
            ram: non_empty(self.ram),
            disk: non_empty(self.disk),
            mining_command: non_empty(self.mining_command),
            notebook_base_port: self.notebook_base_port,
            api_url: self.api_url,
            data_url: self.data_url,
            registry: self.registry,
            notebook_host: self.notebook_host,
        }
    }
}

pub async fn run(args: MineArgs) -> Result<()> {
    let config = load_config(args.into_file_config())?.miner_config();
    let store = TokenStore::default_location()?;

    print_header("Emrys Miner");
    print_key_value("API", &config.endpoints.api);
    print_key_value(
        "Devices",
        &config
            .devices
            .as_ref()
            .map(|d| format!("{:?}", d))
            .unwrap_or_else(|| "all".to_string()),
    );
    println!();

    supervisor::run(config, store).await
}
