//! CLI definitions for Conveyor.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Conveyor CLI.
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Durable execution and scheduling core")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config/conveyor.toml",
        env = "CONVEYOR_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the dispatch loop and timer scheduler in foreground (default)
    Run {
        /// Re-submit every dead-lettered item once the queue is running
        #[arg(long)]
        replay_dead_letters: bool,
    },

    /// Inspect or cancel durable timers
    Timers {
        #[command(subcommand)]
        action: TimerAction,
    },

    /// Inspect or purge continuation tokens
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Inspect or purge the dead-letter store
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum TimerAction {
    /// List timers
    List {
        /// Filter by status (pending, fired, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Cancel a pending timer
    Cancel {
        /// Timer ID
        id: Uuid,
    },
}

#[derive(Subcommand)]
pub(crate) enum TokenAction {
    /// Show one token, or list tokens
    Show {
        /// Token ID (lists tokens when omitted)
        id: Option<Uuid>,

        /// Only list tokens of this activity
        #[arg(long)]
        activity: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Delete expired tokens
    Purge,
}

#[derive(Subcommand)]
pub(crate) enum DeadLetterAction {
    /// List dead-lettered items, oldest first
    List {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Delete every dead-lettered item
    Purge,
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Validate the configuration file
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "--config",
            "custom.toml",
            "tokens",
            "show",
            "--activity",
            "index",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Some(Commands::Tokens {
                action: TokenAction::Show { id, activity, format },
            }) => {
                assert!(id.is_none());
                assert_eq!(activity.as_deref(), Some("index"));
                assert_eq!(format, "table");
            }
            _ => panic!("expected tokens show"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_timer_id() {
        assert!(Cli::try_parse_from(["conveyor", "timers", "cancel", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_run_flag() {
        let cli = Cli::try_parse_from(["conveyor", "run", "--replay-dead-letters"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Run {
                replay_dead_letters: true
            })
        ));
    }
}
