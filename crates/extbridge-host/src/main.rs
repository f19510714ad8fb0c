//! Extension bridge daemon.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use extbridge_host::app::{AppError, planned_routes, run_bridge};
use extbridge_host::config::{BridgeConfig, write_example_config};

/// Extension bridge CLI.
#[derive(Debug, Parser)]
#[command(name = "extbridge-host")]
#[command(about = "Serves extension REST actions by forwarding them to extension processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Start extensions and serve their routes.
    Run {
        /// TOML config file path.
        #[arg(long, default_value = "extbridge.toml")]
        config: String,
    },
    /// Validate registrations and print the route table.
    Routes {
        /// TOML config file path.
        #[arg(long, default_value = "extbridge.toml")]
        config: String,
    },
    /// Write an example config file.
    InitConfig {
        /// Destination path.
        #[arg(long, default_value = "extbridge.toml")]
        path: String,
        /// Replace an existing file.
        #[arg(long)]
        overwrite: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config } => match BridgeConfig::from_toml_file(&config) {
            Ok(cfg) => run_bridge(cfg).await,
            Err(err) => Err(AppError::Config(err)),
        },
        Command::Routes { config } => print_routes(&config),
        Command::InitConfig { path, overwrite } => {
            write_example_config(&path, overwrite).map_err(AppError::Io)
        }
    };

    if let Err(err) = result {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn print_routes(config: &str) -> Result<(), AppError> {
    let cfg = BridgeConfig::from_toml_file(config)?;
    for route in planned_routes(&cfg)? {
        println!("{route}");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
