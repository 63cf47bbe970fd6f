use std::collections::BTreeSet;
use tokio::time::Instant;

use crate::commands::{SessionStatus, UploadProgress};
use crate::errors::{safe_progress_read, AppError};
use crate::image_processor;
use crate::security::InputValidator;

use super::image_groups::{ImageGroup, ImageRecord};
use super::progress_tracker::{mark_item_in_flight, set_session_status, FailureScope};
use super::upload_queue::{deliver_groups, GroupStart, SessionMemory, UploadContext};

/// Retry one failed item that was not part of a group failure.
///
/// The item goes back into its group's forum thread when one exists. On
/// plain channels it is posted without a caption once its group already
/// has a delivered message.
pub async fn retry_single_upload(ctx: &UploadContext, memory: &mut SessionMemory, file_path: &str) {
    set_session_status(&ctx.progress_state, &ctx.session_id, SessionStatus::Uploading);
    let start_time = Instant::now();

    let previous = mark_item_in_flight(&ctx.progress_state, &ctx.session_id, file_path);
    let known_group = previous.and_then(|failed| failed.group_index).and_then(|index| {
        memory.groups.get(index).and_then(|group| {
            group
                .records
                .iter()
                .find(|r| r.file_path == file_path)
                .cloned()
                .map(|record| (index, record))
        })
    });

    let (group_index, record) = match known_group {
        Some(found) => found,
        None => match load_record(file_path).await {
            Ok(record) => {
                // never grouped: it becomes a group of its own
                memory.groups.push(ImageGroup::from_records(vec![record.clone()]));
                (memory.groups.len() - 1, record)
            }
            Err(e) => {
                log::error!("Retry of {} failed before upload: {}", file_path, e);
                ctx.fail(
                    file_path,
                    &e,
                    FailureScope {
                        is_retryable: e.is_retryable(),
                        ..FailureScope::default()
                    },
                );
                finish_retry(ctx);
                return;
            }
        },
    };

    let start = if ctx.destination.is_forum {
        memory
            .threads
            .get(&group_index)
            .cloned()
            .map(GroupStart::Thread)
            .unwrap_or(GroupStart::Fresh)
    } else if group_has_delivered(ctx, memory, group_index) {
        GroupStart::Continuation
    } else {
        GroupStart::Fresh
    };

    log::info!(
        "Retrying {} in group {} ({:?})",
        file_path,
        group_index,
        start
    );

    let group = ImageGroup::from_records(vec![record]);
    let total_groups = memory.groups.len();
    let threads = deliver_groups(ctx, vec![(group_index, group, start)], total_groups, start_time).await;
    memory.threads.extend(threads);

    finish_retry(ctx);
}

/// Re-submit every failed item of each group that suffered a group failure,
/// as fresh groups with a new caption and, on forums, a new thread
pub async fn retry_failed_groups(ctx: &UploadContext, memory: &mut SessionMemory) {
    set_session_status(&ctx.progress_state, &ctx.session_id, SessionStatus::Uploading);
    let start_time = Instant::now();

    let failed_by_group = safe_progress_read(
        &ctx.progress_state,
        &ctx.session_id,
        "group retry read",
        failed_group_items,
    )
    .unwrap_or_default();

    let mut work = Vec::new();
    for (group_index, paths) in failed_by_group {
        let Some(group) = memory.groups.get(group_index) else {
            log::warn!("Group {} is not known to this session, skipping", group_index);
            continue;
        };

        let records: Vec<ImageRecord> = group
            .records
            .iter()
            .filter(|r| paths.contains(&r.file_path))
            .cloned()
            .collect();
        if records.is_empty() {
            continue;
        }

        for record in &records {
            mark_item_in_flight(&ctx.progress_state, &ctx.session_id, &record.file_path);
        }
        memory.threads.remove(&group_index);

        log::info!(
            "Re-submitting {} item(s) of group {}",
            records.len(),
            group_index
        );
        work.push((group_index, ImageGroup::from_records(records), GroupStart::Fresh));
    }

    let total_groups = memory.groups.len();
    let threads = deliver_groups(ctx, work, total_groups, start_time).await;
    memory.threads.extend(threads);

    finish_retry(ctx);
}

/// Failed items of every group that has at least one group failure
pub fn failed_group_items(progress: &UploadProgress) -> Vec<(usize, BTreeSet<String>)> {
    let groups: BTreeSet<usize> = progress
        .failed_uploads
        .iter()
        .filter(|f| f.group_failure)
        .filter_map(|f| f.group_index)
        .collect();

    groups
        .into_iter()
        .map(|group_index| {
            let paths = progress
                .failed_uploads
                .iter()
                .filter(|f| f.group_index == Some(group_index))
                .map(|f| f.file_path.clone())
                .collect();
            (group_index, paths)
        })
        .collect()
}

fn group_has_delivered(ctx: &UploadContext, memory: &SessionMemory, group_index: usize) -> bool {
    let Some(group) = memory.groups.get(group_index) else {
        return false;
    };
    safe_progress_read(&ctx.progress_state, &ctx.session_id, "delivered check", |progress| {
        group
            .records
            .iter()
            .any(|r| progress.successful_uploads.contains(&r.file_path))
    })
    .unwrap_or(false)
}

async fn load_record(file_path: &str) -> Result<ImageRecord, AppError> {
    InputValidator::validate_image_file(file_path)?;
    image_processor::load_image_record(file_path).await
}

fn finish_retry(ctx: &UploadContext) {
    if ctx.is_cancelled() {
        ctx.finish(SessionStatus::Cancelled);
    } else {
        ctx.finish(SessionStatus::Completed);
    }
}
