//! Conveyor - durable execution and scheduling core.
//!
//! Main entry point for the Conveyor CLI.

mod cli;
mod cmd_inspect;
mod cmd_run;

use std::sync::OnceLock;

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_config::{Config, ConfigLoader, LoggingConfig};

use crate::cli::{Cli, Commands};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing with console output and, when `log_dir` is set, a
/// daily-rotated file.
///
/// `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level '{}'", logging.level))?,
    };

    let console = if logging.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    let file = match &logging.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("creating log directory {}", log_dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("conveyor")
                .filename_suffix("log")
                .max_log_files(30)
                .build(log_dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);

            let layer = if logging.json {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_writer(writer).with_ansi(false).boxed()
            };
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    ConfigLoader::load_or_default(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config check reports problems itself, before any logging is set up.
    if let Some(Commands::Config { action }) = &cli.command {
        return cmd_inspect::handle_config_command(action, &cli.config);
    }

    let config = load_config(&cli)?;
    init_tracing(&config.logging)?;

    match cli.command {
        None => cmd_run::run(config, false).await,
        Some(Commands::Run {
            replay_dead_letters,
        }) => cmd_run::run(config, replay_dead_letters).await,
        Some(Commands::Timers { action }) => {
            cmd_inspect::handle_timer_command(action, &config).await
        }
        Some(Commands::Tokens { action }) => {
            cmd_inspect::handle_token_command(action, &config).await
        }
        Some(Commands::DeadLetter { action }) => {
            cmd_inspect::handle_dead_letter_command(action, &config).await
        }
        Some(Commands::Config { .. }) => Ok(()),
    }
}
