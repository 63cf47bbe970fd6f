use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::{DeliveryConfig, GroupingConfig};
use crate::destinations::DestinationStore;
use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;
use crate::uploader::events::EventReceiver;
use crate::uploader::session::UploadSessionManager;
use crate::{image_processor, metadata_editor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub is_forum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub destination_id: i64,
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Grouping,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Grouping => "grouping",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is happening to the item currently being processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "message", rename_all = "snake_case")]
pub enum ItemPhase {
    Preparing,
    LoadingMetadata,
    Compressing,
    Uploading,
    Success,
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub total_images: usize,
    pub completed: usize,
    pub current_image: Option<String>,
    pub current_phase: Option<ItemPhase>,
    pub current_progress: f32,
    pub failed_uploads: Vec<FailedUpload>,
    pub successful_uploads: Vec<String>,
    pub session_status: SessionStatus,
    pub estimated_time_remaining: Option<u64>, // seconds
    /// Items that already reached a first terminal outcome
    #[serde(skip)]
    pub(crate) resolved: HashSet<String>,
    #[serde(skip)]
    pub(crate) failure_counts: HashMap<String, u32>,
}

impl UploadProgress {
    pub fn new(total_images: usize) -> Self {
        Self {
            total_images,
            completed: 0,
            current_image: None,
            current_phase: None,
            current_progress: 0.0,
            failed_uploads: Vec::new(),
            successful_uploads: Vec::new(),
            session_status: SessionStatus::Initializing,
            estimated_time_remaining: None,
            resolved: HashSet::new(),
            failure_counts: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.session_status.is_terminal()
    }

    pub fn failed_item(&self, file_path: &str) -> Option<&FailedUpload> {
        self.failed_uploads.iter().find(|f| f.file_path == file_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUpload {
    pub file_path: String,
    pub error: String,
    pub retry_count: u32,
    pub is_retryable: bool,
    pub group_failure: bool,
    pub group_index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub author: Option<AuthorInfo>,
    pub world: Option<WorldInfo>,
    #[serde(default)]
    pub players: Vec<PlayerInfo>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub display_name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldInfo {
    pub name: String,
    pub id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub display_name: String,
    pub id: String,
}

/// Everything the command surface needs: live sessions and where to send them
pub struct AppState {
    pub sessions: UploadSessionManager,
    pub destinations: Arc<dyn DestinationStore>,
}

impl AppState {
    pub fn new(destinations: Arc<dyn DestinationStore>) -> Self {
        Self {
            sessions: UploadSessionManager::new(),
            destinations,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sessions.subscribe()
    }

    async fn resolve_destination(&self, destination_id: i64) -> AppResult<Destination> {
        if destination_id <= 0 {
            return Err(AppError::validation("destination_id", "Invalid destination ID"));
        }

        let destination = self.destinations.get_destination(destination_id).await?;
        InputValidator::validate_endpoint_url(&destination.url)?;
        Ok(destination)
    }
}

pub async fn start_upload(state: &AppState, request: UploadRequest) -> AppResult<String> {
    if request.file_paths.is_empty() {
        return Err(AppError::validation("file_paths", "No files provided"));
    }

    InputValidator::validate_upload_settings(
        request.delivery.max_items_per_message,
        request.delivery.byte_budget_per_message,
    )?;
    crate::config::validate_quality_ladder(&request.delivery.compression.quality_ladder)?;

    if request.delivery.group_concurrency == 0 {
        return Err(AppError::validation("group_concurrency", "Must be at least 1"));
    }

    let destination = state.resolve_destination(request.destination_id).await?;

    let file_paths = dedup_paths(request.file_paths);

    log::info!(
        "Starting upload of {} files to destination '{}' (forum: {})",
        file_paths.len(),
        destination.name,
        destination.is_forum
    );

    state.sessions.start(
        file_paths,
        destination,
        request.grouping,
        request.delivery,
    )
}

/// Each file is uploaded once; later repeats of a path are dropped
fn dedup_paths(file_paths: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let before = file_paths.len();
    let unique: Vec<String> = file_paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect();
    if unique.len() < before {
        log::warn!("Ignoring {} duplicate file path(s)", before - unique.len());
    }
    unique
}

pub async fn get_upload_progress(state: &AppState, session_id: &str) -> AppResult<UploadProgress> {
    state.sessions.poll(session_id)
}

pub async fn retry_failed_upload(
    state: &AppState,
    session_id: &str,
    file_path: &str,
    destination_id: i64,
) -> AppResult<()> {
    if file_path.trim().is_empty() {
        return Err(AppError::validation("file_path", "File path cannot be empty"));
    }

    let destination = state.resolve_destination(destination_id).await?;
    state.sessions.retry(session_id, file_path, Some(destination))
}

pub async fn retry_failed_group(state: &AppState, session_id: &str) -> AppResult<()> {
    state.sessions.retry_group(session_id)
}

pub async fn cancel_upload_session(state: &AppState, session_id: &str) -> AppResult<()> {
    log::info!("Attempting to cancel upload session: {}", session_id);
    state.sessions.cancel(session_id)
}

pub async fn dismiss_upload_session(state: &AppState, session_id: &str) -> AppResult<()> {
    state.sessions.dismiss(session_id)
}

pub async fn get_image_metadata(file_path: &str) -> AppResult<Option<ImageMetadata>> {
    InputValidator::validate_file_path(file_path)?;
    image_processor::extract_metadata(file_path).await
}

pub async fn update_image_metadata(file_path: &str, metadata: ImageMetadata) -> AppResult<String> {
    metadata_editor::embed_metadata(file_path, metadata).await
}

pub async fn get_image_info(file_path: &str) -> AppResult<(u32, u32, u64)> {
    let path = file_path.to_string();
    tokio::task::spawn_blocking(move || image_processor::get_image_info(&path))
        .await
        .map_err(|e| AppError::Internal(format!("Image info task failed: {}", e)))?
}

/// Header-only info for many files at once. Unreadable files map to `None`.
pub async fn get_image_info_batch(
    file_paths: Vec<String>,
) -> AppResult<Vec<(String, Option<(u32, u32, u64)>)>> {
    use tokio::sync::Semaphore;

    let max_concurrent = num_cpus().min(8);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    let handles: Vec<_> = file_paths
        .into_iter()
        .map(|file_path| {
            let sem = semaphore.clone();
            tokio::spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (file_path, None),
                };
                let path = file_path.clone();
                match tokio::task::spawn_blocking(move || image_processor::get_image_info(&path))
                    .await
                {
                    Ok(Ok(info)) => (file_path, Some(info)),
                    Ok(Err(e)) => {
                        log::warn!("Failed to get image info for {}: {}", file_path, e);
                        (file_path, None)
                    }
                    Err(e) => {
                        log::error!("Image info task panicked: {}", e);
                        (file_path, None)
                    }
                }
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => log::error!("Image info task failed: {}", e),
        }
    }

    Ok(results)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destinations::InMemoryDestinationStore;

    fn state() -> AppState {
        AppState::new(Arc::new(InMemoryDestinationStore::new()))
    }

    #[test]
    fn test_dedup_paths_keeps_first_occurrence() {
        let paths = vec!["b.png", "a.png", "b.png", "c.png", "a.png"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(dedup_paths(paths), vec!["b.png", "a.png", "c.png"]);
    }

    #[test]
    fn test_session_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Grouping.is_terminal());
        assert_eq!(SessionStatus::Uploading.to_string(), "uploading");
    }

    #[test]
    fn test_item_phase_serialization() {
        let json = serde_json::to_value(ItemPhase::Error("boom".to_string())).unwrap();
        assert_eq!(json["phase"], "error");
        assert_eq!(json["message"], "boom");
        let json = serde_json::to_value(ItemPhase::Compressing).unwrap();
        assert_eq!(json["phase"], "compressing");
    }

    #[test]
    fn test_progress_snapshot_hides_bookkeeping() {
        let mut progress = UploadProgress::new(3);
        progress.resolved.insert("a.png".to_string());
        let json = serde_json::to_value(&progress).unwrap();
        assert!(json.get("resolved").is_none());
        assert_eq!(json["session_status"], "initializing");
    }

    #[tokio::test]
    async fn test_start_upload_validates_request() {
        let state = state();

        let empty = UploadRequest {
            destination_id: 1,
            file_paths: vec![],
            grouping: GroupingConfig::default(),
            delivery: DeliveryConfig::default(),
        };
        assert!(matches!(
            start_upload(&state, empty).await,
            Err(AppError::Validation { .. })
        ));

        let unknown = UploadRequest {
            destination_id: 42,
            file_paths: vec!["a.png".to_string()],
            grouping: GroupingConfig::default(),
            delivery: DeliveryConfig::default(),
        };
        assert!(matches!(
            start_upload(&state, unknown).await,
            Err(AppError::DestinationNotFound { id: 42 })
        ));

        let too_many = UploadRequest {
            destination_id: 1,
            file_paths: vec!["a.png".to_string()],
            grouping: GroupingConfig::default(),
            delivery: DeliveryConfig {
                max_items_per_message: 11,
                ..DeliveryConfig::default()
            },
        };
        assert!(start_upload(&state, too_many).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let state = state();
        assert!(matches!(
            get_upload_progress(&state, "missing").await,
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(matches!(
            cancel_upload_session(&state, "missing").await,
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(matches!(
            retry_failed_group(&state, "missing").await,
            Err(AppError::SessionNotFound { .. })
        ));
        assert!(matches!(
            dismiss_upload_session(&state, "missing").await,
            Err(AppError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_image_info_batch_marks_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        image::RgbImage::new(4, 3).save(&good).unwrap();
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"nope").unwrap();

        let results = get_image_info_batch(vec![
            good.to_string_lossy().to_string(),
            bad.to_string_lossy().to_string(),
        ])
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.map(|(w, h, _)| (w, h)), Some((4, 3)));
        assert!(results[1].1.is_none());
    }
}
