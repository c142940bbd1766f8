//! Polybot trading daemon.
//!
//! Loads the TOML configuration, assembles the engine, and runs until
//! SIGINT/SIGTERM. Exit codes: 0 clean shutdown, 1 configuration error,
//! 2 persistent-store error, 3 credentials error.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use polybot::config::Config;
use polybot::engine;

#[derive(Debug, Parser)]
#[command(name = "polybot", about = "Prediction-market trading engine")]
struct Cli {
    /// Path to the TOML configuration document.
    #[arg(long, env = "POLYBOT_CONFIG", default_value = "polybot.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "configuration rejected");
            return ExitCode::from(1);
        }
    };

    info!(
        config = %cli.config.display(),
        mode = config.mode.as_str(),
        strategies = config.strategies.len(),
        "polybot starting"
    );

    match engine::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal engine error");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
