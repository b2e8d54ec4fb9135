//! Inspection subcommands: timers, tokens, dead letters and config.

use std::path::Path;
use std::sync::Arc;

use conveyor_config::{Config, ConfigLoader, ConfigValidator};
use conveyor_continuation::{ContinuationManager, SqliteTokenStore};
use conveyor_dispatch::{DeadLetterStore, FileDeadLetterStore};
use conveyor_protocols::OwnerRef;
use conveyor_timer::{SqliteTimerStore, TimerScheduler, TimerStatus, TimerStore};

use crate::cli::{ConfigAction, DeadLetterAction, TimerAction, TokenAction};

/// Handle timer subcommands.
pub(crate) async fn handle_timer_command(
    action: TimerAction,
    config: &Config,
) -> anyhow::Result<()> {
    let store = SqliteTimerStore::open(&config.store.database_path).await?;
    match action {
        TimerAction::List { status, format } => {
            let status = status.map(|s| s.parse::<TimerStatus>()).transpose()?;
            let timers = store.list(status).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&timers)?);
                return Ok(());
            }
            if timers.is_empty() {
                println!("No timers found.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<8}  {:<9}  {:<25}  OWNER",
                "ID", "ACTION", "STATUS", "FIRE_AT"
            );
            println!("{}", "-".repeat(100));
            for timer in timers {
                println!(
                    "{:<36}  {:<8}  {:<9}  {:<25}  {}",
                    timer.id,
                    timer.action,
                    timer.status,
                    timer.fire_at.to_rfc3339(),
                    describe_owner(&timer.owner)
                );
            }
            Ok(())
        }
        TimerAction::Cancel { id } => {
            let scheduler = TimerScheduler::new(config.scheduler.clone(), Arc::new(store));
            if scheduler.cancel_timer(id).await? {
                println!("Cancelled timer {}", id);
            } else {
                println!("Timer {} is no longer pending; nothing to cancel", id);
            }
            Ok(())
        }
    }
}

/// Handle continuation token subcommands.
pub(crate) async fn handle_token_command(
    action: TokenAction,
    config: &Config,
) -> anyhow::Result<()> {
    let store = SqliteTokenStore::open(&config.store.database_path).await?;
    let manager = ContinuationManager::new(config.continuation.clone(), Arc::new(store));
    match action {
        TokenAction::Show {
            id: Some(id),
            format,
            ..
        } => {
            let Some(token) = manager.get_token(id).await? else {
                anyhow::bail!("continuation token {} not found", id);
            };
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&token)?);
            } else {
                println!("Token:      {}", token.id);
                println!("Activity:   {} ({})", token.activity_id, token.activity_type);
                println!("Owner:      {}", describe_owner(&token.owner));
                println!("Chunk:      {}/{}", token.chunk_index, token.total_chunks);
                println!("Progress:   {:.1}%", token.progress * 100.0);
                println!(
                    "Items:      {} processed, {} remaining",
                    token.processed_items.len(),
                    token.remaining_items.len()
                );
                println!("Created:    {}", token.created_at.to_rfc3339());
                println!("Expires:    {}", token.expires_at.to_rfc3339());
            }
            Ok(())
        }
        TokenAction::Show {
            id: None,
            activity,
            format,
        } => {
            let tokens = manager.list_tokens(activity.as_deref()).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&tokens)?);
                return Ok(());
            }
            if tokens.is_empty() {
                println!("No continuation tokens found.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<24}  {:>9}  {:>8}  EXPIRES",
                "ID", "ACTIVITY", "CHUNK", "PROGRESS"
            );
            println!("{}", "-".repeat(100));
            for token in tokens {
                println!(
                    "{:<36}  {:<24}  {:>9}  {:>7.1}%  {}",
                    token.id,
                    token.activity_id,
                    format!("{}/{}", token.chunk_index, token.total_chunks),
                    token.progress * 100.0,
                    token.expires_at.to_rfc3339()
                );
            }
            Ok(())
        }
        TokenAction::Purge => {
            let purged = manager.purge_expired().await?;
            println!("Purged {} expired token(s)", purged);
            Ok(())
        }
    }
}

/// Handle dead-letter subcommands.
pub(crate) async fn handle_dead_letter_command(
    action: DeadLetterAction,
    config: &Config,
) -> anyhow::Result<()> {
    let store = FileDeadLetterStore::new(&config.store.dead_letter_dir).await?;
    match action {
        DeadLetterAction::List { format } => {
            let entries = store.list().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("Dead-letter store is empty.");
                return Ok(());
            }
            println!(
                "{:<36}  {:<20}  {:>7}  {:<25}  ERROR",
                "ID", "DESTINATION", "RETRIES", "DEAD_LETTERED_AT"
            );
            println!("{}", "-".repeat(110));
            for entry in entries {
                println!(
                    "{:<36}  {:<20}  {:>7}  {:<25}  {}",
                    entry.id(),
                    entry.item.destination,
                    entry.item.retry_count,
                    entry.dead_lettered_at.to_rfc3339(),
                    entry.last_error
                );
            }
            Ok(())
        }
        DeadLetterAction::Purge => {
            let purged = store.purge().await?;
            println!("Purged {} dead-lettered item(s)", purged);
            Ok(())
        }
    }
}

/// Handle config subcommands.
pub(crate) fn handle_config_command(action: &ConfigAction, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Check => {
            let config = ConfigLoader::load(path)?;
            let result = ConfigValidator::validate(&config);
            for warning in &result.warnings {
                println!("warning: {}: {}", warning.path, warning.message);
            }
            for error in &result.errors {
                println!("error: {}: {}", error.path, error.message);
            }
            let warnings = result.into_result()?;
            println!(
                "{} is valid ({} warning(s))",
                path.display(),
                warnings.len()
            );
            Ok(())
        }
    }
}

fn describe_owner(owner: &OwnerRef) -> String {
    let parts: Vec<&str> = [&owner.run_id, &owner.phase_id, &owner.task_id]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join("/")
    }
}
