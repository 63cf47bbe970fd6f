use crate::commands::{FailedUpload, ItemPhase, SessionStatus};
use crate::errors::{safe_progress_read, safe_progress_update, ProgressState};
use std::sync::atomic::Ordering;
use tokio::time::Instant;

use super::CancelFlag;

/// Check if cancellation was requested for a session
pub fn is_session_cancelled(cancel: &CancelFlag) -> bool {
    cancel.load(Ordering::SeqCst)
}

pub fn request_cancel(cancel: &CancelFlag) {
    cancel.store(true, Ordering::SeqCst);
}

pub fn session_status(progress_state: &ProgressState, session_id: &str) -> Option<SessionStatus> {
    safe_progress_read(progress_state, session_id, "status read", |progress| {
        progress.session_status
    })
}

pub fn set_session_status(progress_state: &ProgressState, session_id: &str, status: SessionStatus) {
    safe_progress_update(progress_state, session_id, "status update", |progress| {
        log::debug!(
            "Session {} status {} -> {}",
            session_id,
            progress.session_status,
            status
        );
        progress.session_status = status;
    });
}

/// Update progress with the item currently being worked on
pub fn update_progress_current(
    progress_state: &ProgressState,
    session_id: &str,
    file_path: &str,
    phase: ItemPhase,
    progress_percent: f32,
) {
    safe_progress_update(progress_state, session_id, "phase update", |progress| {
        log::debug!(
            "Progress: {:?} {} ({}%)",
            phase,
            file_path,
            progress_percent as u32
        );
        progress.current_image = Some(file_path.to_string());
        progress.current_phase = Some(phase);
        progress.current_progress = progress_percent;
    });
}

/// Mark a file upload as successful
pub fn update_progress_success(progress_state: &ProgressState, session_id: &str, file_path: &str) {
    safe_progress_update(progress_state, session_id, "success update", |progress| {
        if progress.resolved.insert(file_path.to_string()) {
            progress.completed += 1;
        }

        progress.failed_uploads.retain(|f| f.file_path != file_path);
        if !progress.successful_uploads.iter().any(|s| s == file_path) {
            progress.successful_uploads.push(file_path.to_string());
        }
        progress.current_phase = Some(ItemPhase::Success);
        progress.current_progress = 100.0;

        log::info!(
            "Progress: Successfully uploaded {} ({}/{})",
            file_path,
            progress.completed,
            progress.total_images
        );
    });
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureScope {
    pub is_retryable: bool,
    pub group_failure: bool,
    pub group_index: Option<usize>,
}

/// Mark a file upload as failed. Repeat failures bump `retry_count`.
pub fn update_progress_failure(
    progress_state: &ProgressState,
    session_id: &str,
    file_path: &str,
    error: &str,
    scope: FailureScope,
) {
    safe_progress_update(progress_state, session_id, "failure update", |progress| {
        if progress.resolved.insert(file_path.to_string()) {
            progress.completed += 1;
        }

        let failures = progress
            .failure_counts
            .entry(file_path.to_string())
            .or_insert(0);
        *failures += 1;
        let retry_count = *failures - 1;

        progress.successful_uploads.retain(|s| s != file_path);
        let failed = FailedUpload {
            file_path: file_path.to_string(),
            error: error.to_string(),
            retry_count,
            is_retryable: scope.is_retryable,
            group_failure: scope.group_failure,
            group_index: scope.group_index,
        };
        match progress
            .failed_uploads
            .iter_mut()
            .find(|f| f.file_path == file_path)
        {
            Some(existing) => *existing = failed,
            None => progress.failed_uploads.push(failed),
        }
        progress.current_phase = Some(ItemPhase::Error(error.to_string()));

        log::warn!(
            "Progress: Failed to upload {} - {} ({}/{}{})",
            file_path,
            error,
            progress.completed,
            progress.total_images,
            if scope.group_failure { ", group failure" } else { "" }
        );
    });
}

/// Move a failed item back in flight ahead of a retry
pub fn mark_item_in_flight(
    progress_state: &ProgressState,
    session_id: &str,
    file_path: &str,
) -> Option<FailedUpload> {
    let mut removed = None;
    safe_progress_update(progress_state, session_id, "retry in flight", |progress| {
        if let Some(index) = progress
            .failed_uploads
            .iter()
            .position(|f| f.file_path == file_path)
        {
            removed = Some(progress.failed_uploads.remove(index));
        }
    });
    removed
}

/// Update the estimated time remaining for upload completion
pub fn update_time_estimate(progress_state: &ProgressState, session_id: &str, start_time: Instant) {
    let Some((completed, total)) =
        safe_progress_read(progress_state, session_id, "time estimate read", |p| {
            (p.completed, p.total_images)
        })
    else {
        return;
    };
    if completed == 0 {
        return;
    }

    let elapsed = start_time.elapsed().as_secs_f64();
    let rate = completed as f64 / elapsed.max(f64::EPSILON);
    let remaining = total.saturating_sub(completed);

    // 30% allowance for compression overhead
    let compression_factor = 1.3;
    let estimated_seconds = if rate > 0.0 {
        ((remaining as f64 / rate) * compression_factor) as u64
    } else {
        0
    };

    safe_progress_update(
        progress_state,
        session_id,
        "time estimate update",
        |progress| {
            progress.estimated_time_remaining = Some(estimated_seconds);
            if estimated_seconds > 0 {
                log::debug!(
                    "ETA updated: {}m {}s (rate: {:.2} images/sec, remaining: {})",
                    estimated_seconds / 60,
                    estimated_seconds % 60,
                    rate,
                    remaining
                );
            }
        },
    );
}

/// Mark session as completed
pub fn mark_session_completed(progress_state: &ProgressState, session_id: &str) {
    safe_progress_update(progress_state, session_id, "mark completed", |progress| {
        progress.session_status = SessionStatus::Completed;
        progress.estimated_time_remaining = Some(0);
        progress.current_image = None;

        log::info!(
            "Session {} completed: {}/{} successful, {} failed",
            session_id,
            progress.successful_uploads.len(),
            progress.total_images,
            progress.failed_uploads.len()
        );
    });
}

/// Mark session as failed
pub fn mark_session_failed(progress_state: &ProgressState, session_id: &str) {
    safe_progress_update(progress_state, session_id, "mark failed", |progress| {
        progress.session_status = SessionStatus::Failed;
        progress.estimated_time_remaining = Some(0);
        progress.current_image = None;

        log::error!(
            "Session {} marked as failed: {}/{} successful, {} failed",
            session_id,
            progress.successful_uploads.len(),
            progress.total_images,
            progress.failed_uploads.len()
        );
    });
}

/// Mark an upload session as cancelled
pub fn mark_session_cancelled(progress_state: &ProgressState, session_id: &str) {
    safe_progress_update(progress_state, session_id, "mark cancelled", |progress| {
        progress.session_status = SessionStatus::Cancelled;
        progress.estimated_time_remaining = Some(0);
        progress.current_image = None;
        log::info!(
            "Marked session {} as cancelled with {} completed uploads",
            session_id,
            progress.completed
        );
    });
}
