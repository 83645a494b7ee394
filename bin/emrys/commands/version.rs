//! `emrys version`

use super::load_config;
use crate::style::*;
use anyhow::{Context, Result};
use clap::Args;
use emrys::auction::is_compatible;
use emrys::{CoordinatorClient, FileConfig, TokenHandle, Transport, CLIENT_VERSION};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct VersionArgs {
    #[arg(long, env = "EMRYS_API_URL", hide = true)]
    pub api_url: Option<String>,
}

pub async fn run(args: VersionArgs) -> Result<()> {
    print_header("Version");
    print_key_value("Client", CLIENT_VERSION);

    let config = load_config(FileConfig {
        api_url: args.api_url,
        ..Default::default()
    })?;
    let client = CoordinatorClient::new(Transport::new(TokenHandle::default()), config.endpoints());
    let info = client
        .miner_version(&CancellationToken::new())
        .await
        .context("Failed to reach the coordinator")?;
    print_key_value("Minimum supported", &info.version);

    if is_compatible(CLIENT_VERSION, &info.version)? {
        print_key_value("Status", &style_green("up to date"));
    } else {
        print_key_value("Status", &style_red("unsupported"));
        print_warning("This client can no longer mine, please update");
    }
    Ok(())
}
