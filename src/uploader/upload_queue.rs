use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

use crate::commands::{Destination, ItemPhase, SessionStatus};
use crate::compression::{self, CompressionOutcome};
use crate::config::{CompressionFormat, DeliveryConfig, GroupingConfig};
use crate::errors::{safe_emit_event, AppError, AppResult, ProgressState};
use crate::image_processor;
use crate::security::InputValidator;

use super::chunk_planner::{plan_chunks, split_in_half, Chunk, ChunkLimits};
use super::discord_client::{extract_thread_id, DiscordClient, UploadPayload};
use super::events::{EventSender, ProgressEvent, UploadPhase};
use super::image_groups::{group_images, ImageGroup, ImageRecord};
use super::payload::Caption;
use super::progress_tracker::*;
use super::{cancellable_sleep, CancelFlag};

/// Files whose records are loaded concurrently during the grouping phase
const RECORD_LOAD_CONCURRENCY: usize = 4;

/// Everything one session's pipeline needs, shared by all of its groups
pub struct UploadContext {
    pub session_id: String,
    pub destination: Destination,
    pub delivery: DeliveryConfig,
    pub client: Arc<DiscordClient>,
    pub progress_state: ProgressState,
    pub events: EventSender,
    pub cancel: CancelFlag,
}

impl UploadContext {
    pub fn emit(&self, phase: UploadPhase) {
        safe_emit_event(&self.events, ProgressEvent::new(&self.session_id, phase));
    }

    pub fn is_cancelled(&self) -> bool {
        is_session_cancelled(&self.cancel)
    }

    fn is_forum(&self) -> bool {
        self.destination.is_forum
    }

    fn limits(&self) -> ChunkLimits {
        ChunkLimits::from_delivery(&self.delivery)
    }

    pub fn succeed(&self, file_path: &str) {
        update_progress_success(&self.progress_state, &self.session_id, file_path);
        self.emit(UploadPhase::ItemSuccess {
            file_path: file_path.to_string(),
        });
    }

    pub fn fail(&self, file_path: &str, error: &AppError, scope: FailureScope) {
        let message = error.to_string();
        update_progress_failure(
            &self.progress_state,
            &self.session_id,
            file_path,
            &message,
            scope,
        );
        self.emit(UploadPhase::ItemError {
            file_path: file_path.to_string(),
            message,
        });
    }

    /// Emit the terminal status after it is visible in the snapshot
    pub fn finish(&self, status: SessionStatus) {
        match status {
            SessionStatus::Cancelled => mark_session_cancelled(&self.progress_state, &self.session_id),
            SessionStatus::Failed => mark_session_failed(&self.progress_state, &self.session_id),
            _ => mark_session_completed(&self.progress_state, &self.session_id),
        }
        self.emit(UploadPhase::SessionFinished { status });
    }
}

/// What the worker keeps after the first pass, for later retries
#[derive(Debug, Default)]
pub struct SessionMemory {
    pub groups: Vec<ImageGroup>,
    /// Forum thread per group index, once created
    pub threads: HashMap<usize, String>,
}

/// Run the whole first pass of a session: pre-flight, grouping and delivery
pub async fn process_upload_queue(
    ctx: &UploadContext,
    file_paths: Vec<String>,
    grouping: &GroupingConfig,
) -> SessionMemory {
    let start_time = Instant::now();
    let mut memory = SessionMemory::default();

    if ctx.is_cancelled() {
        log::info!("Session {} was cancelled before processing started", ctx.session_id);
        ctx.finish(SessionStatus::Cancelled);
        return memory;
    }

    if ctx.delivery.verify_destination {
        if let Err(e) = ctx.client.verify_destination(&ctx.destination.url).await {
            log::error!(
                "Destination '{}' failed the pre-flight check: {}",
                ctx.destination.name,
                e
            );
            let scope = FailureScope {
                is_retryable: e.is_retryable(),
                ..FailureScope::default()
            };
            for file_path in &file_paths {
                ctx.fail(file_path, &e, scope);
            }
            ctx.finish(SessionStatus::Failed);
            return memory;
        }
    }

    set_session_status(&ctx.progress_state, &ctx.session_id, SessionStatus::Grouping);
    let records = load_records(ctx, file_paths).await;

    if ctx.is_cancelled() {
        log::info!("Session {} cancelled before grouping images", ctx.session_id);
        ctx.finish(SessionStatus::Cancelled);
        return memory;
    }

    memory.groups = group_images(records, grouping);
    ctx.emit(UploadPhase::Grouped {
        group_count: memory.groups.len(),
    });
    set_session_status(&ctx.progress_state, &ctx.session_id, SessionStatus::Uploading);

    let total_groups = memory.groups.len();
    let work: Vec<(usize, ImageGroup, GroupStart)> = memory
        .groups
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, group)| (index, group, GroupStart::Fresh))
        .collect();
    memory.threads = deliver_groups(ctx, work, total_groups, start_time).await;

    if ctx.is_cancelled() {
        ctx.finish(SessionStatus::Cancelled);
    } else {
        ctx.finish(SessionStatus::Completed);
    }
    memory
}

async fn load_records(ctx: &UploadContext, file_paths: Vec<String>) -> Vec<ImageRecord> {
    if let Some(first) = file_paths.first() {
        update_progress_current(
            &ctx.progress_state,
            &ctx.session_id,
            first,
            ItemPhase::LoadingMetadata,
            0.0,
        );
    }
    ctx.emit(UploadPhase::LoadingMetadata {
        file_paths: file_paths.clone(),
    });

    let loaded: Vec<(String, AppResult<ImageRecord>)> = stream::iter(file_paths)
        .map(|file_path| async move {
            let result = match InputValidator::validate_image_file(&file_path) {
                Ok(()) => image_processor::load_image_record(&file_path).await,
                Err(e) => Err(e),
            };
            (file_path, result)
        })
        .buffered(RECORD_LOAD_CONCURRENCY)
        .collect()
        .await;

    let mut records = Vec::with_capacity(loaded.len());
    for (file_path, result) in loaded {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                log::error!("Could not read {}: {}", file_path, e);
                let scope = FailureScope {
                    is_retryable: e.is_retryable(),
                    ..FailureScope::default()
                };
                ctx.fail(&file_path, &e, scope);
            }
        }
    }
    records
}

/// How a group's first message relates to earlier deliveries
#[derive(Debug, Clone, PartialEq)]
pub enum GroupStart {
    /// New caption, and a new thread on forum destinations
    Fresh,
    /// Post into an existing thread without a caption
    Thread(String),
    /// Plain channel continuation without a caption
    Continuation,
}

/// Deliver groups, up to `group_concurrency` at a time, and return the
/// forum threads that now exist per group index
pub async fn deliver_groups(
    ctx: &UploadContext,
    groups: Vec<(usize, ImageGroup, GroupStart)>,
    total_groups: usize,
    start_time: Instant,
) -> HashMap<usize, String> {
    let concurrency = ctx.delivery.group_concurrency.max(1);
    let count = groups.len();
    let delivered: Vec<(usize, Option<String>)> = stream::iter(groups.into_iter().enumerate())
        .map(|(position, (group_index, group, start))| async move {
            let thread = deliver_group(ctx, group_index, &group, total_groups, start).await;
            update_time_estimate(&ctx.progress_state, &ctx.session_id, start_time);

            if position + 1 < count && !ctx.is_cancelled() {
                let _ = cancellable_sleep(ctx.delivery.group_delay(), &ctx.cancel, "group delay").await;
            }
            (group_index, thread)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    delivered
        .into_iter()
        .filter_map(|(index, thread)| thread.map(|t| (index, t)))
        .collect()
}

/// One attachment ready to post
#[derive(Debug, Clone)]
struct Attachment {
    file_path: String,
    filename: String,
    original: Arc<Vec<u8>>,
    data: Arc<Vec<u8>>,
    mime_type: String,
    format: Option<CompressionFormat>,
    quality: Option<u8>,
}

impl Attachment {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone)]
struct Batch {
    attachments: Vec<Attachment>,
    /// Already re-sent once with corrected encoding
    corrected: bool,
}

impl Batch {
    fn file_paths(&self) -> Vec<String> {
        self.attachments.iter().map(|a| a.file_path.clone()).collect()
    }

    fn total_bytes(&self) -> u64 {
        self.attachments.iter().map(Attachment::size).sum()
    }

    fn split(self) -> (Batch, Batch) {
        let (first, second) = split_in_half(self.attachments);
        (
            Batch {
                attachments: first,
                corrected: self.corrected,
            },
            Batch {
                attachments: second,
                corrected: self.corrected,
            },
        )
    }
}

enum Work {
    Planned(Chunk),
    Prepared(Batch),
}

impl Work {
    fn file_paths(&self) -> Vec<String> {
        match self {
            Work::Planned(chunk) => chunk.file_paths(),
            Work::Prepared(batch) => batch.file_paths(),
        }
    }
}

/// Per-group delivery state shared by all of its chunks
struct GroupDelivery {
    group_index: usize,
    group_size: usize,
    /// Sent with the first successful message, then cleared
    caption: Option<Caption>,
    thread_id: Option<String>,
    requests_sent: usize,
}

impl GroupDelivery {
    fn creating_thread(&self, is_forum: bool) -> bool {
        is_forum && self.thread_id.is_none() && self.caption.is_some()
    }

    fn scope(&self, is_retryable: bool, group_failure: bool) -> FailureScope {
        FailureScope {
            is_retryable,
            group_failure,
            group_index: Some(self.group_index),
        }
    }
}

/// Deliver one group's chunks in order. Returns the forum thread id, if any.
async fn deliver_group(
    ctx: &UploadContext,
    group_index: usize,
    group: &ImageGroup,
    total_groups: usize,
    start: GroupStart,
) -> Option<String> {
    if ctx.is_cancelled() {
        log::info!(
            "Session {} cancelled before group {} upload",
            ctx.session_id,
            group_index
        );
        return None;
    }

    log::info!(
        "Starting group {} of {} ({} images)",
        group_index + 1,
        total_groups,
        group.len()
    );
    ctx.emit(UploadPhase::GroupStart {
        group_index,
        total_groups,
    });

    let (caption, thread_id) = match start {
        GroupStart::Fresh => (
            Some(Caption::for_group(
                group,
                ctx.delivery.include_player_names,
                ctx.is_forum(),
            )),
            None,
        ),
        GroupStart::Thread(thread_id) => (None, Some(thread_id)),
        GroupStart::Continuation => (None, None),
    };

    let mut delivery = GroupDelivery {
        group_index,
        group_size: group.len(),
        caption,
        thread_id,
        requests_sent: 0,
    };

    let mut queue: VecDeque<Work> = plan_chunks(group_index, group, ctx.limits())
        .into_iter()
        .map(Work::Planned)
        .collect();

    while let Some(work) = queue.pop_front() {
        if ctx.is_cancelled() {
            log::info!(
                "Session {} cancelled, leaving {} chunk(s) of group {} unsent",
                ctx.session_id,
                queue.len() + 1,
                group_index
            );
            break;
        }

        let batch = match work {
            Work::Planned(chunk) => {
                let batch = prepare_chunk(ctx, &delivery, chunk).await;
                if batch.attachments.is_empty() {
                    continue;
                }
                if batch.attachments.len() > 1
                    && batch.total_bytes() > ctx.delivery.byte_budget_per_message
                {
                    log::info!(
                        "Prepared chunk of {} bytes exceeds the budget, splitting",
                        batch.total_bytes()
                    );
                    let (first, second) = batch.split();
                    queue.push_front(Work::Prepared(second));
                    queue.push_front(Work::Prepared(first));
                    continue;
                }
                batch
            }
            Work::Prepared(batch) => batch,
        };

        if delivery.requests_sent > 0
            && cancellable_sleep(
                ctx.delivery.chunk_delay(ctx.is_forum()),
                &ctx.cancel,
                "chunk delay",
            )
            .await
            .is_err()
        {
            break;
        }

        send_batch(ctx, &mut delivery, &mut queue, batch).await;
    }

    delivery.thread_id
}

async fn prepare_chunk(ctx: &UploadContext, delivery: &GroupDelivery, chunk: Chunk) -> Batch {
    let mut attachments = Vec::with_capacity(chunk.len());
    let total = chunk.len();

    for (index, record) in chunk.records.into_iter().enumerate() {
        let file_path = record.file_path;
        update_progress_current(
            &ctx.progress_state,
            &ctx.session_id,
            &file_path,
            ItemPhase::Preparing,
            index as f32 / total as f32 * 100.0,
        );
        ctx.emit(UploadPhase::Preparing {
            file_path: file_path.clone(),
        });

        match prepare_attachment(ctx, &file_path).await {
            Ok(attachment) => attachments.push(attachment),
            Err(e) => {
                log::error!("Failed to prepare {}: {}", file_path, e);
                ctx.fail(&file_path, &e, delivery.scope(e.is_retryable(), false));
            }
        }
    }

    Batch {
        attachments,
        corrected: false,
    }
}

async fn prepare_attachment(ctx: &UploadContext, file_path: &str) -> AppResult<Attachment> {
    let original = Arc::new(tokio::fs::read(file_path).await?);
    let budget = ctx.delivery.byte_budget_per_message;
    let config = &ctx.delivery.compression;

    let mut attachment = Attachment {
        file_path: file_path.to_string(),
        filename: attachment_name(file_path, None, false),
        original: original.clone(),
        data: original.clone(),
        mime_type: original_mime_type(file_path),
        format: None,
        quality: None,
    };

    if !compression::needs_compression(original.len() as u64, budget) {
        return Ok(attachment);
    }

    update_progress_current(
        &ctx.progress_state,
        &ctx.session_id,
        file_path,
        ItemPhase::Compressing,
        0.0,
    );
    ctx.emit(UploadPhase::Compressing {
        file_path: file_path.to_string(),
    });

    let mut formats = vec![config.format];
    if config.try_alternate_format {
        formats.push(config.format.alternate());
    }

    for format in formats {
        match compression::compress_to_budget(file_path, original.clone(), budget, format, config)
            .await
        {
            Ok(CompressionOutcome::Unchanged(_)) => return Ok(attachment),
            Ok(CompressionOutcome::Recoded(compressed)) => {
                log::info!(
                    "Compressed {} from {} to {} bytes ({} q{})",
                    file_path,
                    original.len(),
                    compressed.size(),
                    compressed.format.as_str(),
                    compressed.quality
                );
                attachment.filename = attachment_name(file_path, Some(compressed.format), false);
                attachment.mime_type = compressed.format.mime_type().to_string();
                attachment.format = Some(compressed.format);
                attachment.quality = Some(compressed.quality);
                attachment.data = Arc::new(compressed.data);
                return Ok(attachment);
            }
            Err(AppError::FormatExhausted { format }) => {
                log::warn!("{} ladder exhausted for {}", format, file_path);
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::compression_exhausted(file_path))
}

async fn send_batch(
    ctx: &UploadContext,
    delivery: &mut GroupDelivery,
    queue: &mut VecDeque<Work>,
    batch: Batch,
) {
    let file_paths = batch.file_paths();
    let mut payload = UploadPayload::new();
    if let Some(caption) = &delivery.caption {
        payload.add_text_field("content", &caption.content);
        if delivery.creating_thread(ctx.is_forum()) {
            if let Some(thread_name) = &caption.thread_name {
                payload.add_text_field("thread_name", thread_name);
            }
        }
    }
    for attachment in &batch.attachments {
        payload.add_file(&attachment.filename, attachment.data.clone(), &attachment.mime_type);
    }

    for (index, file_path) in file_paths.iter().enumerate() {
        update_progress_current(
            &ctx.progress_state,
            &ctx.session_id,
            file_path,
            ItemPhase::Uploading,
            index as f32 / file_paths.len() as f32 * 100.0,
        );
    }
    ctx.emit(UploadPhase::Uploading {
        file_paths: file_paths.clone(),
    });

    log::info!(
        "Uploading {} image(s), {} bytes, for group {}",
        batch.attachments.len(),
        payload.total_bytes(),
        delivery.group_index
    );

    delivery.requests_sent += 1;
    let result = ctx
        .client
        .send_webhook_with_thread_id(
            &ctx.destination.url,
            &payload,
            delivery.thread_id.as_deref(),
            &ctx.cancel,
        )
        .await;

    match result {
        Ok(response) => on_delivered(ctx, delivery, queue, &file_paths, &response).await,
        Err(AppError::UploadCancelled { phase }) => {
            log::info!(
                "Upload cancelled during {}, {} item(s) left unsent",
                phase,
                file_paths.len()
            );
        }
        Err(AppError::EndpointRejected { status: 413, detail }) => {
            on_too_large(ctx, delivery, queue, batch, detail).await;
        }
        Err(AppError::EndpointRejected { status: 400, detail }) if !batch.corrected => {
            log::warn!(
                "Endpoint rejected the request encoding ({}), retrying once corrected",
                detail
            );
            match correct_batch(ctx, batch).await {
                Ok(corrected) => queue.push_front(Work::Prepared(corrected)),
                Err((paths, e)) => fail_request(ctx, delivery, queue, &paths, &e, false),
            }
        }
        Err(e) => {
            let group_failure = e.status_code() == Some(400)
                && delivery.group_size > file_paths.len();
            fail_request(ctx, delivery, queue, &file_paths, &e, group_failure);
        }
    }
}

async fn on_delivered(
    ctx: &UploadContext,
    delivery: &mut GroupDelivery,
    queue: &mut VecDeque<Work>,
    file_paths: &[String],
    response: &str,
) {
    let creating_thread = delivery.creating_thread(ctx.is_forum());
    let caption = delivery.caption.take();

    if creating_thread {
        delivery.thread_id = extract_thread_id(response);
        match &delivery.thread_id {
            Some(thread_id) => log::info!(
                "Forum thread {} created for group {}",
                thread_id,
                delivery.group_index
            ),
            None if !queue.is_empty() => {
                log::error!(
                    "No thread id in forum response, failing the rest of group {}",
                    delivery.group_index
                );
                fail_remaining(
                    ctx,
                    delivery,
                    queue,
                    &AppError::thread_creation_failed("response did not include a thread id"),
                );
            }
            None => log::warn!("No thread id in forum response for group {}", delivery.group_index),
        }
    }

    for file_path in file_paths {
        ctx.succeed(file_path);
    }

    if let Some(caption) = caption {
        if ctx.delivery.send_overflow_player_messages {
            send_overflow_messages(ctx, delivery, &caption).await;
        }
    }
}

async fn send_overflow_messages(ctx: &UploadContext, delivery: &mut GroupDelivery, caption: &Caption) {
    for (i, message) in caption.overflow_messages.iter().enumerate() {
        if ctx.is_forum() && delivery.thread_id.is_none() {
            log::warn!("Skipping overflow player messages, no forum thread");
            return;
        }
        delivery.requests_sent += 1;
        if let Err(e) = ctx
            .client
            .send_text_message(
                &ctx.destination.url,
                message,
                delivery.thread_id.as_deref(),
                &ctx.cancel,
            )
            .await
        {
            log::warn!("Failed to send overflow message {}: {}", i + 1, e);
            if ctx.is_cancelled() {
                return;
            }
        }
    }
}

async fn on_too_large(
    ctx: &UploadContext,
    delivery: &mut GroupDelivery,
    queue: &mut VecDeque<Work>,
    batch: Batch,
    detail: String,
) {
    if batch.attachments.len() > 1 {
        log::warn!(
            "Endpoint rejected {} attachments as too large, splitting",
            batch.attachments.len()
        );
        let (first, second) = batch.split();
        queue.push_front(Work::Prepared(second));
        queue.push_front(Work::Prepared(first));
        return;
    }

    let Some(attachment) = batch.attachments.into_iter().next() else {
        return;
    };
    let config = &ctx.delivery.compression;
    let format = attachment.format.unwrap_or(config.format);

    update_progress_current(
        &ctx.progress_state,
        &ctx.session_id,
        &attachment.file_path,
        ItemPhase::Compressing,
        0.0,
    );
    ctx.emit(UploadPhase::Compressing {
        file_path: attachment.file_path.clone(),
    });

    match compression::force_recompress(
        &attachment.file_path,
        attachment.original.clone(),
        attachment.size(),
        attachment.quality,
        ctx.delivery.byte_budget_per_message,
        format,
        config,
    )
    .await
    {
        Ok(compressed) => {
            log::info!(
                "Recompressed {} to {} bytes at quality {}",
                attachment.file_path,
                compressed.size(),
                compressed.quality
            );
            let retried = Attachment {
                filename: attachment_name(&attachment.file_path, Some(compressed.format), batch.corrected),
                mime_type: compressed.format.mime_type().to_string(),
                format: Some(compressed.format),
                quality: Some(compressed.quality),
                data: Arc::new(compressed.data),
                ..attachment
            };
            queue.push_front(Work::Prepared(Batch {
                attachments: vec![retried],
                corrected: batch.corrected,
            }));
        }
        Err(e) => {
            log::error!(
                "Cannot shrink {} any further ({}), giving up",
                attachment.file_path,
                e
            );
            fail_request(
                ctx,
                delivery,
                queue,
                &[attachment.file_path],
                &AppError::rejected(413, &detail),
                false,
            );
        }
    }
}

async fn correct_batch(ctx: &UploadContext, batch: Batch) -> Result<Batch, (Vec<String>, AppError)> {
    let paths = batch.file_paths();
    let mut attachments = Vec::with_capacity(batch.attachments.len());

    for attachment in batch.attachments {
        let recoded =
            match compression::reencode_for_compatibility(attachment.original.clone(), &ctx.delivery.compression)
                .await
            {
                Ok(recoded) => recoded,
                Err(e) => return Err((paths, e)),
            };
        attachments.push(Attachment {
            filename: attachment_name(&attachment.file_path, Some(recoded.format), true),
            mime_type: recoded.format.mime_type().to_string(),
            format: Some(recoded.format),
            quality: Some(recoded.quality),
            data: Arc::new(recoded.data),
            ..attachment
        });
    }

    Ok(Batch {
        attachments,
        corrected: true,
    })
}

/// Record a terminal request failure. A failed thread-creating request
/// takes the rest of its group down with it.
fn fail_request(
    ctx: &UploadContext,
    delivery: &GroupDelivery,
    queue: &mut VecDeque<Work>,
    file_paths: &[String],
    error: &AppError,
    group_failure: bool,
) {
    if delivery.creating_thread(ctx.is_forum()) {
        let error = AppError::thread_creation_failed(&error.to_string());
        let scope = delivery.scope(error.is_retryable(), true);
        for file_path in file_paths {
            ctx.fail(file_path, &error, scope);
        }
        fail_remaining(ctx, delivery, queue, &error);
        return;
    }

    let scope = delivery.scope(error.is_retryable(), group_failure);
    for file_path in file_paths {
        ctx.fail(file_path, error, scope);
    }
}

fn fail_remaining(
    ctx: &UploadContext,
    delivery: &GroupDelivery,
    queue: &mut VecDeque<Work>,
    error: &AppError,
) {
    let scope = delivery.scope(error.is_retryable(), true);
    for work in queue.drain(..) {
        for file_path in work.file_paths() {
            ctx.fail(&file_path, error, scope);
        }
    }
}

fn attachment_name(file_path: &str, format: Option<CompressionFormat>, ascii: bool) -> String {
    let path = Path::new(file_path);
    let name = match format {
        Some(format) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "image".to_string());
            format!("{}.{}", stem, format.extension())
        }
        None => path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string()),
    };

    if ascii {
        InputValidator::ascii_filename(&name)
    } else {
        InputValidator::sanitize_filename(&name)
    }
}

fn original_mime_type(file_path: &str) -> String {
    image::ImageFormat::from_path(file_path)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_names() {
        assert_eq!(attachment_name("/tmp/a/VRChat_1.png", None, false), "VRChat_1.png");
        assert_eq!(
            attachment_name("/tmp/a/VRChat_1.png", Some(CompressionFormat::Jpeg), false),
            "VRChat_1.jpg"
        );
        assert_eq!(
            attachment_name("/tmp/写真 1.png", Some(CompressionFormat::Webp), true),
            "___1.webp"
        );
    }

    #[test]
    fn test_original_mime_type() {
        assert_eq!(original_mime_type("a.png"), "image/png");
        assert_eq!(original_mime_type("a.JPG"), "image/jpeg");
        assert_eq!(original_mime_type("a.unknown"), "application/octet-stream");
    }

    #[test]
    fn test_creating_thread_only_before_first_post() {
        let mut delivery = GroupDelivery {
            group_index: 0,
            group_size: 3,
            caption: Some(Caption::default()),
            thread_id: None,
            requests_sent: 0,
        };
        assert!(delivery.creating_thread(true));
        assert!(!delivery.creating_thread(false));
        delivery.thread_id = Some("1".to_string());
        assert!(!delivery.creating_thread(true));
    }
}
