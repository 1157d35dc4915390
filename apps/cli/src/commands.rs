//! CLI command implementations

use crate::output::{done, format_bytes, format_progress, format_size, short_name, status_icon};
use crate::{OutputFormat, Target};
use anyhow::{anyhow, Result};
use console::style;
use fetchq_core::DownloadEngine;
use fetchq_types::{CompletedDownload, Download, GroupSummary, Priority, Request, Status};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Intake
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub async fn add_download(
    engine: &DownloadEngine,
    url: String,
    file: PathBuf,
    priority: Priority,
    group: i32,
    tag: Option<String>,
    hold: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut request = Request::new(url, file)
        .with_priority(priority)
        .with_group(group)
        .with_download_on_enqueue(!hold);
    request.tag = tag;

    let download = engine.enqueue(request).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            done(format!(
                "Added download: {} [{}]",
                style(short_name(&download, 60)).cyan(),
                download.status
            ));
            println!("  ID: {}", download.id);
        }
    }

    Ok(())
}

pub async fn add_completed(
    engine: &DownloadEngine,
    url: String,
    file: PathBuf,
    group: i32,
    format: OutputFormat,
) -> Result<()> {
    let size = tokio::fs::metadata(&file).await?.len();
    let mut completed = CompletedDownload::new(url, file, size);
    completed.group_id = group;

    let download = engine.add_completed_download(completed, true).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            done(format!(
                "Catalogued {} ({})",
                style(short_name(&download, 60)).cyan(),
                format_bytes(size)
            ));
            println!("  ID: {}", download.id);
        }
    }

    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

pub async fn list_downloads(
    engine: &DownloadEngine,
    status: Option<Status>,
    group: Option<i32>,
    tag: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let downloads = match (status, group) {
        (Some(status), Some(group)) => {
            engine
                .get_downloads_in_group_with_status(group, vec![status])
                .await?
        }
        (Some(status), None) => engine.get_downloads_with_status(status).await?,
        (None, Some(group)) => engine.get_downloads_in_group(group).await?,
        (None, None) => engine.get_downloads().await?,
    };
    let filtered: Vec<Download> = downloads
        .into_iter()
        .filter(|d| tag.is_none() || d.request.tag == tag)
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: String,
                file: String,
                group: i32,
                priority: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|d| DownloadRow {
                    id: d.id.to_string()[..8].to_string(),
                    file: short_name(d, 30),
                    group: d.group_id(),
                    priority: d.priority().as_str().to_string(),
                    size: format_size(d),
                    progress: format_progress(d),
                    status: d.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &filtered {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(download: &Download, detailed: bool) {
    println!(
        "{} {} {} [{}]",
        status_icon(download.status),
        style(short_name(download, 60)).bold(),
        style(format_progress(download)).dim(),
        style(download.status).dim()
    );

    if detailed {
        println!("    ID: {}", download.id);
        println!("    URL: {}", download.url());
        println!("    File: {}", download.file().display());
        println!("    Size: {}", format_size(download));
        println!(
            "    Group: {}  Priority: {}",
            download.group_id(),
            download.priority().as_str()
        );
        if let Some(ref tag) = download.request.tag {
            println!("    Tag: {}", tag);
        }
        if download.auto_retry_attempts > 0 {
            println!("    Automatic retries: {}", download.auto_retry_attempts);
        }
        if let Some(ref error) = download.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}

pub async fn show_info(engine: &DownloadEngine, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = Uuid::parse_str(id)?;
    let download = engine
        .get_download(uuid)
        .await?
        .ok_or_else(|| anyhow!("Download not found: {}", uuid))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        _ => {
            print_download_summary(&download, true);
            let blocks = engine.get_download_blocks(uuid).await?;
            if !blocks.is_empty() {
                let complete = blocks.iter().filter(|b| b.is_complete()).count();
                println!("    Blocks: {}/{} complete", complete, blocks.len());
            }
        }
    }

    Ok(())
}

pub async fn list_groups(engine: &DownloadEngine, format: OutputFormat) -> Result<()> {
    let mut groups: Vec<GroupSummary> = Vec::new();
    for group_id in engine.get_all_group_ids().await? {
        groups.push(engine.get_group(group_id).await?);
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct GroupRow {
                group: i32,
                downloads: usize,
                queued: usize,
                paused: usize,
                completed: usize,
                failed: usize,
                progress: String,
            }

            let rows: Vec<GroupRow> = groups
                .iter()
                .map(|g| GroupRow {
                    group: g.group_id,
                    downloads: g.len(),
                    queued: g.queued,
                    paused: g.paused,
                    completed: g.completed,
                    failed: g.failed,
                    progress: g
                        .progress
                        .map(|p| format!("{p}%"))
                        .unwrap_or_else(|| "?".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if groups.is_empty() {
                println!("{}", style("No downloads found").dim());
            }
            for group in &groups {
                println!(
                    "{} {} {} download(s), {} completed, {} failed",
                    style("•").cyan(),
                    style(format!("group {}", group.group_id)).bold(),
                    group.len(),
                    group.completed,
                    group.failed
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Control
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub enum Action {
    Pause,
    Resume,
    Cancel,
    Retry,
    Remove,
    Delete,
}

impl Action {
    fn past_tense(self) -> &'static str {
        match self {
            Action::Pause => "paused",
            Action::Resume => "resumed",
            Action::Cancel => "cancelled",
            Action::Retry => "queued for retry",
            Action::Remove => "removed",
            Action::Delete => "deleted",
        }
    }
}

fn parse_ids(ids: &[String]) -> Result<Vec<Uuid>> {
    ids.iter()
        .map(|id| Uuid::parse_str(id).map_err(|e| anyhow!("Invalid download ID {}: {}", id, e)))
        .collect()
}

pub async fn apply(engine: &DownloadEngine, action: Action, target: Target, format: OutputFormat) -> Result<()> {
    let changed = if target.all {
        match action {
            Action::Pause => engine.pause_all().await?,
            Action::Resume => engine.resume_all().await?,
            Action::Cancel => engine.cancel_all().await?,
            Action::Retry => {
                let ids = engine
                    .get_downloads_with_statuses(vec![Status::Failed, Status::Cancelled])
                    .await?
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                engine.retry_ids(ids).await?
            }
            Action::Remove => engine.remove_all().await?,
            Action::Delete => engine.delete_all().await?,
        }
    } else if let Some(group) = target.group {
        match action {
            Action::Pause => engine.pause_group(group).await?,
            Action::Resume => engine.resume_group(group).await?,
            Action::Cancel => engine.cancel_group(group).await?,
            Action::Retry => {
                let ids = engine
                    .get_downloads_in_group_with_status(group, vec![Status::Failed, Status::Cancelled])
                    .await?
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                engine.retry_ids(ids).await?
            }
            Action::Remove => engine.remove_group(group).await?,
            Action::Delete => engine.delete_group(group).await?,
        }
    } else {
        if target.ids.is_empty() {
            return Err(anyhow!("Give at least one download ID, --group or --all"));
        }
        let ids = parse_ids(&target.ids)?;
        match action {
            Action::Pause => engine.pause_all_ids(ids).await?,
            Action::Resume => engine.resume_ids(ids).await?,
            Action::Cancel => engine.cancel_ids(ids).await?,
            Action::Retry => engine.retry_ids(ids).await?,
            Action::Remove => engine.remove_ids(ids).await?,
            Action::Delete => engine.delete_ids(ids).await?,
        }
    };

    report(&changed, action.past_tense(), format)
}

pub async fn clear(
    engine: &DownloadEngine,
    status: Status,
    with_files: bool,
    yes: bool,
    format: OutputFormat,
) -> Result<()> {
    if !yes {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(format!("Remove every {} download?", status))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    let changed = if with_files {
        engine.delete_all_with_status(status).await?
    } else {
        engine.remove_all_with_status(status).await?
    };
    report(&changed, if with_files { "deleted" } else { "removed" }, format)
}

fn report(changed: &[Download], verb: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(changed)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            if changed.is_empty() {
                println!("{}", style("Nothing to do").dim());
                return Ok(());
            }
            for download in changed {
                println!("  {} {}", status_icon(download.status), short_name(download, 60));
            }
            done(format!("{} download(s) {}", changed.len(), verb));
        }
    }
    Ok(())
}
