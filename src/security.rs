use regex::Regex;
use std::path::{Component, Path};

use crate::errors::{AppError, AppResult};

const SUPPORTED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "gif", "bmp"];

pub struct InputValidator;

impl InputValidator {
    pub fn validate_destination_name(name: &str) -> AppResult<()> {
        let trimmed = name.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("name", "Destination name cannot be empty"));
        }

        if trimmed.chars().count() > 100 {
            return Err(AppError::validation(
                "name",
                "Destination name too long (max 100 characters)",
            ));
        }

        if trimmed.chars().any(|c| c.is_control()) {
            return Err(AppError::validation(
                "name",
                "Destination name contains invalid characters",
            ));
        }

        Ok(())
    }

    /// Strict check for real Discord webhook URLs
    pub fn validate_webhook_url(url: &str) -> AppResult<()> {
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("url", "Webhook URL cannot be empty"));
        }

        if trimmed.len() > 500 {
            return Err(AppError::validation("url", "Webhook URL too long"));
        }

        let webhook_pattern = Regex::new(
            r"^https://(discord\.com|discordapp\.com|ptb\.discord\.com|canary\.discord\.com)/api/webhooks/\d{17,20}/[\w\-]{60,80}$",
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        if !webhook_pattern.is_match(trimmed) {
            return Err(AppError::invalid_webhook(trimmed));
        }

        Ok(())
    }

    /// Loose check used by the engine: any absolute http(s) URL with a host
    pub fn validate_endpoint_url(url: &str) -> AppResult<()> {
        let parsed =
            reqwest::Url::parse(url.trim()).map_err(|_| AppError::invalid_webhook(url))?;

        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AppError::invalid_webhook(url));
        }

        Ok(())
    }

    pub fn validate_file_path(path: &str) -> AppResult<()> {
        if path.trim().is_empty() {
            return Err(AppError::validation("file_path", "File path cannot be empty"));
        }

        let path_obj = Path::new(path);

        if path_obj
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(AppError::validation("file_path", "Invalid file path detected"));
        }

        match path_obj.extension() {
            Some(extension) => {
                let ext = extension.to_string_lossy().to_lowercase();
                if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                    return Err(AppError::invalid_file_type(path));
                }
            }
            None => {
                return Err(AppError::validation("file_path", "File must have an extension"));
            }
        }

        if !path_obj.exists() {
            return Err(AppError::file_not_found(path));
        }

        if !path_obj.is_file() {
            return Err(AppError::validation("file_path", "Path is not a file"));
        }

        Ok(())
    }

    /// Replace characters that are unsafe in attachment names
    pub fn sanitize_filename(filename: &str) -> String {
        let sanitized: String = filename
            .trim()
            .chars()
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();

        if sanitized.chars().count() > 255 {
            let truncated: String = sanitized.chars().take(252).collect();
            format!("{}...", truncated)
        } else {
            sanitized
        }
    }

    /// ASCII-only attachment name, for endpoints that reject the original encoding
    pub fn ascii_filename(filename: &str) -> String {
        let sanitized = Self::sanitize_filename(filename);
        let ascii: String = sanitized
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if ascii.trim_matches(|c| c == '_' || c == '.').is_empty() {
            "image".to_string()
        } else {
            ascii
        }
    }

    /// Path checks plus a header probe; the image is not fully decoded
    pub fn validate_image_file(file_path: &str) -> AppResult<()> {
        Self::validate_file_path(file_path)?;

        image::ImageReader::open(file_path)?
            .with_guessed_format()?
            .into_dimensions()?;

        Ok(())
    }

    pub fn validate_upload_settings(max_images: u8, byte_budget: u64) -> AppResult<()> {
        if max_images == 0 || max_images > 10 {
            return Err(AppError::validation("max_images", "Must be between 1 and 10"));
        }

        if byte_budget == 0 {
            return Err(AppError::validation(
                "byte_budget_per_message",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

pub struct FileSystemGuard;

impl FileSystemGuard {
    pub fn get_file_size(path: &str) -> AppResult<u64> {
        let metadata = std::fs::metadata(path)?;
        Ok(metadata.len())
    }
}
