//! Session lifecycle: one worker task per upload, kept alive after the first
//! pass to serve retries until the retention window passes without activity.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::commands::{Destination, SessionStatus, UploadProgress};
use crate::config::{DeliveryConfig, GroupingConfig};
use crate::errors::{AppError, AppResult, ProgressState};

use super::discord_client::DiscordClient;
use super::events::{self, EventReceiver, EventSender};
use super::progress_tracker::request_cancel;
use super::retry::{failed_group_items, retry_failed_groups, retry_single_upload};
use super::upload_queue::{process_upload_queue, UploadContext};
use super::CancelFlag;

#[derive(Debug)]
enum SessionCommand {
    RetryItem {
        file_path: String,
        destination: Option<Destination>,
    },
    RetryGroups,
    Dismiss,
}

struct SessionHandle {
    cancel: CancelFlag,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

type SessionHandles = Arc<Mutex<HashMap<String, SessionHandle>>>;

#[derive(Clone)]
pub struct UploadSessionManager {
    progress_state: ProgressState,
    handles: SessionHandles,
    events: EventSender,
}

impl Default for UploadSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadSessionManager {
    pub fn new() -> Self {
        let (events, _) = events::channel();
        Self {
            progress_state: Arc::new(Mutex::new(HashMap::new())),
            handles: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Create a session and spawn its worker. Must run inside a tokio runtime.
    pub fn start(
        &self,
        file_paths: Vec<String>,
        destination: Destination,
        grouping: GroupingConfig,
        delivery: DeliveryConfig,
    ) -> AppResult<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let client = Arc::new(DiscordClient::new(delivery.retry.clone())?);
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let (commands, receiver) = mpsc::unbounded_channel();

        {
            let mut progress = self
                .progress_state
                .lock()
                .map_err(|e| AppError::Internal(format!("Failed to lock progress state: {}", e)))?;
            progress.insert(session_id.clone(), UploadProgress::new(file_paths.len()));
        }
        {
            let mut handles = self.lock_handles()?;
            handles.insert(
                session_id.clone(),
                SessionHandle {
                    cancel: cancel.clone(),
                    commands,
                },
            );
        }

        let retention = delivery.session_retention();
        let ctx = UploadContext {
            session_id: session_id.clone(),
            destination,
            delivery,
            client,
            progress_state: self.progress_state.clone(),
            events: self.events.clone(),
            cancel,
        };

        log::info!(
            "Starting upload session {} with {} files",
            session_id,
            file_paths.len()
        );

        tokio::spawn(run_session(
            ctx,
            file_paths,
            grouping,
            receiver,
            retention,
            self.handles.clone(),
        ));

        Ok(session_id)
    }

    pub fn poll(&self, session_id: &str) -> AppResult<UploadProgress> {
        let progress = self
            .progress_state
            .lock()
            .map_err(|e| AppError::Internal(format!("Failed to lock progress state: {}", e)))?;

        progress
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::session_not_found(session_id))
    }

    pub fn cancel(&self, session_id: &str) -> AppResult<()> {
        let status = self.poll(session_id)?.session_status;
        if status.is_terminal() {
            return Err(AppError::session_terminal(session_id, status.as_str()));
        }

        let handles = self.lock_handles()?;
        let handle = handles
            .get(session_id)
            .ok_or_else(|| AppError::session_not_found(session_id))?;
        request_cancel(&handle.cancel);
        log::info!("Cancellation requested for session {}", session_id);
        Ok(())
    }

    /// Retry one failed item on a completed session
    pub fn retry(
        &self,
        session_id: &str,
        file_path: &str,
        destination: Option<Destination>,
    ) -> AppResult<()> {
        self.claim_for_retry(session_id, |progress| {
            let failed = progress.failed_item(file_path).ok_or_else(|| {
                AppError::validation("file_path", "File is not in the failed list")
            })?;
            if failed.group_failure {
                return Err(AppError::validation(
                    "file_path",
                    "File failed as part of its group; retry the group instead",
                ));
            }
            Ok(())
        })?;

        self.send_command(
            session_id,
            SessionCommand::RetryItem {
                file_path: file_path.to_string(),
                destination,
            },
        )
    }

    /// Re-submit every group that suffered a group failure
    pub fn retry_group(&self, session_id: &str) -> AppResult<()> {
        self.claim_for_retry(session_id, |progress| {
            if failed_group_items(progress).is_empty() {
                return Err(AppError::validation(
                    "session_id",
                    "Session has no failed groups to retry",
                ));
            }
            Ok(())
        })?;

        self.send_command(session_id, SessionCommand::RetryGroups)
    }

    /// Evict a session, cancelling it first if it is still running
    pub fn dismiss(&self, session_id: &str) -> AppResult<()> {
        let handle = self.lock_handles()?.remove(session_id);
        let removed = self
            .progress_state
            .lock()
            .map_err(|e| AppError::Internal(format!("Failed to lock progress state: {}", e)))?
            .remove(session_id);

        if handle.is_none() && removed.is_none() {
            return Err(AppError::session_not_found(session_id));
        }

        if let Some(handle) = handle {
            request_cancel(&handle.cancel);
            if handle.commands.send(SessionCommand::Dismiss).is_err() {
                log::debug!("Worker for session {} already stopped", session_id);
            }
        }
        log::info!("Dismissed upload session {}", session_id);
        Ok(())
    }

    /// Check that a retry is allowed and move the session back to
    /// `uploading` under one lock, so concurrent retries cannot both pass
    fn claim_for_retry<F>(&self, session_id: &str, check: F) -> AppResult<()>
    where
        F: FnOnce(&UploadProgress) -> AppResult<()>,
    {
        let mut progress = self
            .progress_state
            .lock()
            .map_err(|e| AppError::Internal(format!("Failed to lock progress state: {}", e)))?;
        let session = progress
            .get_mut(session_id)
            .ok_or_else(|| AppError::session_not_found(session_id))?;

        match session.session_status {
            SessionStatus::Completed => {}
            SessionStatus::Failed | SessionStatus::Cancelled => {
                return Err(AppError::session_terminal(
                    session_id,
                    session.session_status.as_str(),
                ));
            }
            SessionStatus::Initializing | SessionStatus::Grouping | SessionStatus::Uploading => {
                return Err(AppError::SessionBusy {
                    session_id: session_id.to_string(),
                });
            }
        }

        check(session)?;
        session.session_status = SessionStatus::Uploading;
        Ok(())
    }

    fn send_command(&self, session_id: &str, command: SessionCommand) -> AppResult<()> {
        let handles = self.lock_handles()?;
        let sent = handles
            .get(session_id)
            .map(|handle| handle.commands.send(command).is_ok())
            .unwrap_or(false);

        if sent {
            Ok(())
        } else {
            Err(AppError::session_not_found(session_id))
        }
    }

    fn lock_handles(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, SessionHandle>>> {
        self.handles
            .lock()
            .map_err(|e| AppError::Internal(format!("Failed to lock session handles: {}", e)))
    }
}

async fn run_session(
    mut ctx: UploadContext,
    file_paths: Vec<String>,
    grouping: GroupingConfig,
    mut receiver: mpsc::UnboundedReceiver<SessionCommand>,
    retention: Duration,
    handles: SessionHandles,
) {
    let mut memory = process_upload_queue(&ctx, file_paths, &grouping).await;

    loop {
        match timeout(retention, receiver.recv()).await {
            Ok(Some(SessionCommand::RetryItem {
                file_path,
                destination,
            })) => {
                if let Some(destination) = destination {
                    if destination.id != ctx.destination.id {
                        log::info!(
                            "Retrying {} against destination '{}' instead of '{}'",
                            file_path,
                            destination.name,
                            ctx.destination.name
                        );
                        memory.threads.clear();
                    }
                    ctx.destination = destination;
                }
                retry_single_upload(&ctx, &mut memory, &file_path).await;
            }
            Ok(Some(SessionCommand::RetryGroups)) => {
                retry_failed_groups(&ctx, &mut memory).await;
            }
            Ok(Some(SessionCommand::Dismiss)) | Ok(None) => break,
            Err(_) => {
                log::info!(
                    "Session {} idle for {:?}, evicting",
                    ctx.session_id,
                    retention
                );
                break;
            }
        }
    }

    evict(&ctx, &handles);
}

fn evict(ctx: &UploadContext, handles: &SessionHandles) {
    match handles.lock() {
        Ok(mut handles) => {
            handles.remove(&ctx.session_id);
        }
        Err(e) => log::warn!("Failed to lock session handles for eviction (non-critical): {}", e),
    }
    match ctx.progress_state.lock() {
        Ok(mut progress) => {
            progress.remove(&ctx.session_id);
        }
        Err(e) => log::warn!("Failed to lock progress state for eviction (non-critical): {}", e),
    }
    log::debug!("Session {} evicted", ctx.session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::events::UploadPhase;

    fn destination(url: &str) -> Destination {
        Destination {
            id: 1,
            name: "test".to_string(),
            url: url.to_string(),
            is_forum: false,
        }
    }

    fn quick_delivery() -> DeliveryConfig {
        DeliveryConfig {
            verify_destination: false,
            chunk_delay_ms: 0,
            forum_chunk_delay_ms: 0,
            group_delay_ms: 0,
            session_retention_secs: 1,
            ..DeliveryConfig::default()
        }
    }

    async fn wait_for_finish(receiver: &mut EventReceiver) -> SessionStatus {
        loop {
            if let Ok(event) = receiver.recv().await {
                if let UploadPhase::SessionFinished { status } = event.phase {
                    return status;
                }
            }
        }
    }

    #[test]
    fn test_unknown_session() {
        let manager = UploadSessionManager::new();
        assert!(matches!(
            manager.poll("nope"),
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(matches!(
            manager.retry("nope", "a.png", None),
            Err(AppError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreadable_files_complete_with_failures() {
        let manager = UploadSessionManager::new();
        let mut receiver = manager.subscribe();
        let session_id = manager
            .start(
                vec!["/definitely/missing.png".to_string()],
                destination("http://127.0.0.1:9/api/webhooks/1/t"),
                GroupingConfig::default(),
                quick_delivery(),
            )
            .unwrap();

        assert_eq!(wait_for_finish(&mut receiver).await, SessionStatus::Completed);
        let progress = manager.poll(&session_id).unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed_uploads.len(), 1);
        assert!(!progress.failed_uploads[0].group_failure);

        assert!(matches!(
            manager.cancel(&session_id),
            Err(AppError::SessionTerminal { .. })
        ));
        assert!(matches!(
            manager.retry_group(&session_id),
            Err(AppError::Validation { .. })
        ));
        assert!(matches!(
            manager.retry(&session_id, "/not/failed.png", None),
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_dismiss_evicts() {
        let manager = UploadSessionManager::new();
        let mut receiver = manager.subscribe();
        let session_id = manager
            .start(
                vec!["/definitely/missing.png".to_string()],
                destination("http://127.0.0.1:9/api/webhooks/1/t"),
                GroupingConfig::default(),
                quick_delivery(),
            )
            .unwrap();
        wait_for_finish(&mut receiver).await;

        manager.dismiss(&session_id).unwrap();
        assert!(matches!(
            manager.poll(&session_id),
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(manager.dismiss(&session_id).is_err());
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted_after_retention() {
        let manager = UploadSessionManager::new();
        let mut receiver = manager.subscribe();
        let session_id = manager
            .start(
                vec!["/definitely/missing.png".to_string()],
                destination("http://127.0.0.1:9/api/webhooks/1/t"),
                GroupingConfig::default(),
                quick_delivery(),
            )
            .unwrap();
        wait_for_finish(&mut receiver).await;
        assert!(manager.poll(&session_id).is_ok());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(
            manager.poll(&session_id),
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(manager.progress_state.lock().unwrap().is_empty());
        assert!(manager.handles.lock().unwrap().is_empty());
    }
}
