//! emrys: supplier client for the Emrys GPU marketplace

mod commands;
mod style;

use clap::{Parser, Subcommand};
use commands::{login::LoginArgs, mine::MineArgs};
use style::print_error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emrys")]
#[command(about = "Rent out your GPUs on the Emrys marketplace")]
#[command(version)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and save an access token
    Login(LoginArgs),

    /// Bid on jobs with the local GPUs (requires root)
    Mine(MineArgs),

    /// Show client and minimum supported versions
    Version(commands::version::VersionArgs),
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "emrys=debug" } else { "emrys=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(level.parse()?)
                .add_directive("info".parse()?),
        )
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        print_error(&format!("Failed to initialise logging: {}", e));
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Login(args) => commands::login::run(args).await,
        Commands::Mine(args) => commands::mine::run(args).await,
        Commands::Version(args) => commands::version::run(args).await,
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
