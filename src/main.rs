//! Phantom - four-stage derivatives signal pipeline
//!
//! # WARNING
//! - Live mode places real orders on Binance USD-M futures.
//! - Signals are heuristics. Paper trade first.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use phantom_pipeline::cli::commands::{self, RunOptions};
use phantom_pipeline::config::{Config, ExecutionMode};

/// Phantom - trap, absorption, ignition, execution
#[derive(Parser)]
#[command(name = "phantom")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pipeline
    Run {
        /// Symbol for every layer (e.g. BTCUSDT)
        #[arg(long)]
        symbol: Option<String>,

        /// Execution mode: paper or live
        #[arg(long)]
        mode: Option<ExecutionMode>,

        /// Disable Telegram notifications
        #[arg(long)]
        no_telegram: bool,

        /// Disable order placement entirely
        #[arg(long)]
        no_execution: bool,

        /// Skip the live-mode confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check credentials and upstream APIs
    Health,
}

fn init_tracing(json: bool) {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "phantom_pipeline=info".parse() {
        filter = filter.add_directive(directive);
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    // Load configuration
    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    commands::apply_env_credentials(&mut config);

    // Execute command
    let result = match cli.command {
        Commands::Run {
            symbol,
            mode,
            no_telegram,
            no_execution,
            yes,
        } => {
            let options = RunOptions {
                symbol,
                mode,
                no_telegram,
                no_execution,
                yes,
            };
            commands::run(config, options).await
        }
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
