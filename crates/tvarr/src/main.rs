use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use tvarr::app::App;
use tvarr::config::Config;
use tvarr::observability;

#[derive(Parser, Debug)]
#[command(name = "tvarr", version, about = "Self-hosted IPTV aggregation and relay service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the data directory (sandbox root).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    // CLI flags outrank environment and file values.
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _log_control = match observability::init(&config.logging) {
        Ok(control) => control,
        Err(e) => {
            eprintln!("logging setup failed: {e}");
            std::process::exit(2);
        }
    };

    let app = match App::start(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    app.shutdown().await;
}
