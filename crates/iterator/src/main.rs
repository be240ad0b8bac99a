use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use iterator::config::Config;
use iterator::driver;
use iterator::release;
use iterator::server::Server;
use iterator::store::create_store;
use iterator::Result;

#[derive(Parser)]
#[command(name = "iterator", about = "Run infrastructure drivers using alerts", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Release driver resources for the specified alert.
    Release { alert_name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Pick up ITERATOR_* overrides from a .env file if one is present.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            return Err(e);
        }
    };

    match cli.command {
        Some(Commands::Release { alert_name }) => {
            release::send_release(&config.server.address, &alert_name).await
        }
        None => run_server(config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!("Starting iterator..");

    let store = create_store(&config.server).await?;

    // Warm up every configured module in the background.
    driver::init_modules(&config.server.driver, &config.commands);

    let server = Server::new(config, store);
    server.serve().await
}
