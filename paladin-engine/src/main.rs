//! Paladin Engine CLI
//!
//! Entry point for the engine binary. Provides subcommands for:
//! - `run` - Start the engine
//! - `version` - Show version information
//!
//! Exit codes: 0 on clean shutdown, 1 on invalid configuration, 2 on a
//! transport bind failure.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

use paladin_engine::config::Settings;
use paladin_engine::error::EngineError;
use paladin_engine::service::EngineService;
use paladin_plugin::PluginError;

/// Paladin private transaction engine
#[derive(Parser, Debug)]
#[command(name = "paladin-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine
    Run {
        /// Configuration file path; bypasses the layered config directory
        #[arg(short, long)]
        config: Option<String>,

        /// Environment whose overlay file to load from the config directory
        #[arg(short, long, env = "PALADIN_ENV", default_value = "development")]
        environment: String,

        /// Loader UUID gating the plugin loader stream
        #[arg(long, env = "PALADIN_LOADER_ID")]
        loader_id: Option<Uuid>,
    },

    /// Show version information
    Version,
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.logging.level.clone()));
    if settings.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("paladin-engine {}", paladin_engine::VERSION);
            ExitCode::SUCCESS
        }
        Commands::Run {
            config,
            environment,
            loader_id,
        } => {
            // An explicit file wins; otherwise layer config/default.toml,
            // the environment overlay and PALADIN_ environment variables
            let loaded = match &config {
                Some(path) => Settings::from_file(path),
                None => Settings::load(&environment),
            };
            let source = config.unwrap_or_else(|| format!("environment {environment:?}"));
            let settings = match loaded {
                Ok(settings) => settings,
                Err(error) => {
                    eprintln!("invalid configuration ({source}): {error}");
                    return ExitCode::from(1);
                }
            };
            if let Err(errors) = settings.validate() {
                for error in &errors {
                    eprintln!("configuration error: {error}");
                }
                return ExitCode::from(1);
            }
            init_tracing(&settings);
            info!(version = paladin_engine::VERSION, config = %source, "starting paladin engine");

            let loader_id = loader_id.unwrap_or_else(Uuid::new_v4);
            let service = match EngineService::start(&settings, loader_id).await {
                Ok(service) => service,
                Err(EngineError::Plugin(PluginError::BindFailed { address, source })) => {
                    error!(%address, %source, "failed to bind plugin transport");
                    return ExitCode::from(2);
                }
                Err(error) => {
                    error!(%error, "failed to start engine");
                    return ExitCode::from(1);
                }
            };
            if let Some(controller) = service.plugin_controller() {
                info!(loader_id = %controller.loader_id(),
                      target = %controller.grpc_target_url(),
                      "plugin controller ready");
            }

            if let Err(error) = tokio::signal::ctrl_c().await {
                error!(%error, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            service.stop().await;
            ExitCode::SUCCESS
        }
    }
}
