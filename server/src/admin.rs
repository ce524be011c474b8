//! One-shot admin commands. Each brings persistence up from the
//! configuration, does its work through the handle and shuts down again.

use anyhow::{bail, Context};
use player_stats::StatField;
use stats_persistence::{ConnectionState, StatsEntry, StatsHandle};

async fn connect(handle: &StatsHandle) -> anyhow::Result<()> {
    let backend = handle
        .initialize_from_config()
        .await
        .context("persistence did not come up")?;
    tracing::debug!(%backend, "Admin session connected");
    Ok(())
}

pub async fn status(handle: &StatsHandle, json: bool) -> anyhow::Result<()> {
    // Status is still useful when initialization fails.
    if let Err(e) = handle.initialize_from_config().await {
        tracing::warn!("Initialization failed: {}", e);
    }
    let diagnostics = handle.diagnostics().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else {
        println!("{diagnostics}");
    }
    Ok(())
}

pub async fn backup(handle: &StatsHandle) -> anyhow::Result<()> {
    connect(handle).await?;
    match handle.backup_now().await? {
        Some(backup) => println!("Created {backup}"),
        None => println!("Backend has no local files; nothing to back up"),
    }
    Ok(())
}

pub async fn list_backups(handle: &StatsHandle) -> anyhow::Result<()> {
    let backups = handle.list_backups().await?;
    if backups.is_empty() {
        println!("No backups");
    }
    for backup in backups {
        println!("{backup}");
    }
    Ok(())
}

pub async fn restore(handle: &StatsHandle, name: &str) -> anyhow::Result<()> {
    handle
        .restore_backup(name)
        .await
        .with_context(|| format!("restoring {name}"))?;
    if handle.state() != ConnectionState::Ready {
        bail!("restored data did not come up: {}", handle.state());
    }
    println!("Restored {name}");
    Ok(())
}

fn print_entries(entries: &[StatsEntry], field: StatField) {
    for (place, entry) in entries.iter().enumerate() {
        println!(
            "{:>3}. {:<24} {:<20} {}={}",
            place + 1,
            entry.display_name,
            entry.external_id,
            field,
            entry.record.value_of(field)
        );
    }
}

pub async fn top(handle: &StatsHandle, field: StatField, limit: usize) -> anyhow::Result<()> {
    connect(handle).await?;
    let entries = handle.get_top_n(limit, field).await?;
    if entries.is_empty() {
        println!("No players recorded");
    }
    print_entries(&entries, field);
    Ok(())
}

pub async fn show(handle: &StatsHandle, external_id: &str) -> anyhow::Result<()> {
    connect(handle).await?;
    let record = handle.load(external_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn delete(handle: &StatsHandle, external_id: &str) -> anyhow::Result<()> {
    connect(handle).await?;
    if handle.delete(external_id).await? {
        println!("Deleted {external_id}");
    } else {
        println!("No stats stored for {external_id}");
    }
    Ok(())
}
