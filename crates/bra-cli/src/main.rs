//! BRA CLI application
//!
//! Builds a bi-level routing attention block from a configuration file and
//! `BRA_*` environment overrides, then runs or describes it.

use anyhow::{Context, Result};
use bra_common::BraConfig;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::error;

mod commands;

use commands::{InfoCommand, RunCommand};

/// BRA CLI - bi-level routing attention toolkit
#[derive(Parser)]
#[command(name = "bra")]
#[command(about = "Run and inspect bi-level routing attention blocks")]
#[command(version)]
#[command(author = "BRA Contributors")]
struct Cli {
    /// Configuration file path (.toml or .json)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a forward pass on random input
    Run(RunCommand),
    /// Print the resolved configuration as TOML
    Config,
    /// List supported modes and their status
    Info(InfoCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    let result = match cli.command {
        Some(Commands::Run(cmd)) => {
            load_configuration(cli.config.as_deref()).and_then(|config| cmd.execute(&config))
        }
        Some(Commands::Config) => load_configuration(cli.config.as_deref()).and_then(|config| {
            print!("{}", config.to_toml_string().context("Failed to serialize configuration")?);
            Ok(())
        }),
        Some(Commands::Info(cmd)) => cmd.execute(),
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        for cause in e.chain().skip(1) {
            error!("  Caused by: {}", cause);
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Defaults, then the optional file, then `BRA_*` overrides.
fn load_configuration(path: Option<&std::path::Path>) -> Result<BraConfig> {
    BraConfig::load(path).with_context(|| match path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })
}

fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
        }
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}
