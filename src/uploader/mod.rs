// Upload orchestration: grouping, chunking, delivery and session bookkeeping
//
// One worker task per session drives upload_queue; retry reuses the same
// chunk pipeline once the first pass has finished.

pub mod chunk_planner;
pub mod discord_client;
pub mod events;
pub mod image_groups;
pub mod payload;
pub mod progress_tracker;
pub mod retry;
pub mod session;
pub mod upload_queue;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use crate::errors::{AppError, AppResult};

pub use session::UploadSessionManager;
pub use upload_queue::process_upload_queue;

/// Per-session cancellation request, checked at chunk boundaries and waits
pub type CancelFlag = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep that wakes early with `UploadCancelled` once the flag is raised
pub async fn cancellable_sleep(duration: Duration, cancel: &CancelFlag, phase: &str) -> AppResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        if progress_tracker::is_session_cancelled(cancel) {
            return Err(AppError::cancelled(phase));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        sleep((deadline - now).min(CANCEL_POLL_INTERVAL)).await;
    }
}
