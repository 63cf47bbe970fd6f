//! Delivers VRChat photos to Discord webhooks: metadata-based grouping,
//! size-constrained chunking, on-demand compression, retry handling and
//! pollable upload sessions.

pub mod commands;
pub mod compression;
pub mod config;
pub mod destinations;
pub mod errors;
pub mod image_processor;
pub mod metadata_editor;
pub mod security;
pub mod uploader;

pub use commands::AppState;
pub use errors::{AppError, AppResult};
