//! Output formatting utilities

use console::{style, StyledObject};
use fetchq_types::{Download, Status};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// `downloaded / total`, or just the downloaded bytes when the size is unknown
pub fn format_size(download: &Download) -> String {
    match download.total {
        Some(total) => format!("{} / {}", format_bytes(download.downloaded), format_bytes(total)),
        None => format_bytes(download.downloaded),
    }
}

pub fn format_progress(download: &Download) -> String {
    download
        .progress()
        .map(|p| format!("{p}%"))
        .unwrap_or_else(|| "?".to_string())
}

pub fn status_icon(status: Status) -> StyledObject<&'static str> {
    match status {
        Status::Completed => style("✓").green(),
        Status::Downloading => style("↓").cyan(),
        Status::Queued => style("…").cyan(),
        Status::Paused => style("⏸").yellow(),
        Status::Failed => style("✗").red(),
        Status::Cancelled | Status::Removed | Status::Deleted => style("○").dim(),
        Status::Added | Status::None => style("·").dim(),
    }
}

/// File name of a download, shortened for table cells
pub fn short_name(download: &Download, width: usize) -> String {
    let name = download
        .file()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| download.file().display().to_string());
    if name.chars().count() > width {
        let kept: String = name.chars().take(width.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        name
    }
}

pub fn done(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}
