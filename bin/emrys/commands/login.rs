//! `emrys login`

use super::load_config;
use crate::style::*;
use anyhow::{Context, Result};
use clap::Args;
use emrys::{CoordinatorClient, FileConfig, TokenHandle, TokenStore, Transport};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct LoginArgs {
    #[arg(long, env = "EMRYS_EMAIL")]
    pub email: String,

    #[arg(long, env = "EMRYS_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Token lifetime in days
    #[arg(long, default_value = "30")]
    pub duration: u32,

    #[arg(long, env = "EMRYS_API_URL", hide = true)]
    pub api_url: Option<String>,
}

pub async fn run(args: LoginArgs) -> Result<()> {
    let config = load_config(FileConfig {
        api_url: args.api_url,
        ..Default::default()
    })?;
    let client = CoordinatorClient::new(Transport::new(TokenHandle::default()), config.endpoints());

    let token = client
        .login(&CancellationToken::new(), &args.email, &args.password, args.duration)
        .await
        .context("Login failed")?;

    let store = TokenStore::default_location()?;
    store.save(&token)?;
    print_success(&format!(
        "Logged in as {}, token saved to {}",
        args.email,
        store.path().display()
    ));
    Ok(())
}
