//! Download lifecycle rules
//!
//! Every status change in the engine goes through [`transition`], which
//! rejects edges that are not listed in [`can_transition`].

use crate::error::FetchError;
use chrono::Utc;
use fetchq_types::{Download, Status};

/// Whether a download may move from `from` to `to`
pub fn can_transition(from: Status, to: Status) -> bool {
    match (from, to) {
        (Status::None, Status::Added | Status::Queued | Status::Completed) => true,
        (
            Status::Added,
            Status::Queued | Status::Cancelled | Status::Removed | Status::Deleted,
        ) => true,
        (
            Status::Queued,
            Status::Downloading
            | Status::Paused
            | Status::Cancelled
            | Status::Removed
            | Status::Deleted,
        ) => true,
        // Downloading -> Queued is an automatic retry or a shutdown hand-back
        (
            Status::Downloading,
            Status::Queued
            | Status::Paused
            | Status::Completed
            | Status::Failed
            | Status::Cancelled
            | Status::Removed
            | Status::Deleted,
        ) => true,
        (
            Status::Paused,
            Status::Queued | Status::Cancelled | Status::Removed | Status::Deleted,
        ) => true,
        (
            Status::Failed | Status::Cancelled,
            Status::Queued | Status::Removed | Status::Deleted,
        ) => true,
        (Status::Completed, Status::Removed | Status::Deleted) => true,
        _ => false,
    }
}

/// Statuses a pause applies to
pub fn is_pausable(status: Status) -> bool {
    matches!(status, Status::Queued | Status::Downloading)
}

/// Statuses a resume applies to
pub fn is_resumable(status: Status) -> bool {
    matches!(status, Status::Paused | Status::Added)
}

/// Statuses a cancel applies to
pub fn is_cancellable(status: Status) -> bool {
    matches!(
        status,
        Status::Added | Status::Queued | Status::Downloading | Status::Paused
    )
}

/// Statuses a retry applies to
pub fn is_retryable(status: Status) -> bool {
    matches!(status, Status::Failed | Status::Cancelled)
}

/// Statuses no transfer will run from again without a retry
pub fn is_finished(status: Status) -> bool {
    matches!(status, Status::Completed | Status::Failed | Status::Cancelled)
}

/// Move `download` to `to`, keeping the error and completion fields consistent
pub fn transition(download: &mut Download, to: Status) -> Result<(), FetchError> {
    if !can_transition(download.status, to) {
        return Err(FetchError::InvalidOperation(format!(
            "download {} cannot move from {} to {}",
            download.id, download.status, to
        )));
    }

    download.status = to;
    match to {
        Status::Completed => {
            download.error = None;
            download.completed_at = Some(Utc::now());
        }
        Status::Queued | Status::Downloading => download.error = None,
        _ => {}
    }

    Ok(())
}
