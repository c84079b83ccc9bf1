//! crossmatrix CLI entrypoint.

use clap::{Parser, ValueEnum};
use console::style;
use std::process::ExitCode;
use tracing::{Level, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod handlers;
mod signals;

use commands::Commands;
use config::CliConfig;

#[derive(Parser)]
#[command(name = "crossmatrix")]
#[command(author, version, about = "Cross-platform build and test matrix runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Initialise the global subscriber. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool, format: LogFormat) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("failed to initialise logging: {e}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = CliConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable CLI config");
        CliConfig::default()
    });

    let outcome = match cli.command {
        Commands::Run(args) => handlers::run(&config, args).await,
        Commands::Validate { path } => handlers::validate(&path),
        Commands::Matrix {
            selection,
            allow_fallback,
            json,
        } => handlers::matrix(&selection, allow_fallback, json),
        Commands::Targets => handlers::targets(),
        Commands::Init { path, force } => handlers::init(&path, force),
        Commands::Schema { document } => handlers::schema(document),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::from(handlers::exit_status_for(&e))
        }
    }
}
