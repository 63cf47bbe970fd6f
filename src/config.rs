use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::uploader::discord_client::RetryConfig;

/// Raster formats the compression service can recode into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl CompressionFormat {
    pub fn alternate(self) -> Self {
        match self {
            CompressionFormat::Jpeg => CompressionFormat::Webp,
            CompressionFormat::Webp => CompressionFormat::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Jpeg => "jpg",
            CompressionFormat::Webp => "webp",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            CompressionFormat::Jpeg => "image/jpeg",
            CompressionFormat::Webp => "image/webp",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionFormat::Jpeg => "jpeg",
            CompressionFormat::Webp => "webp",
        }
    }
}

/// How records are clustered into groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub group_by_world: bool,
    pub group_by_time: bool,
    /// Maximum distance from a group's earliest timestamp, in seconds
    pub time_window_secs: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            group_by_world: true,
            group_by_time: true,
            time_window_secs: 10 * 60,
        }
    }
}

impl GroupingConfig {
    pub fn ungrouped() -> Self {
        Self {
            group_by_world: false,
            group_by_time: false,
            time_window_secs: 0,
        }
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub format: CompressionFormat,
    /// Strictly descending quality levels tried in order
    pub quality_ladder: Vec<u8>,
    pub try_alternate_format: bool,
    /// Sources above this size are downscaled before encoding
    pub large_file_threshold: u64,
    pub max_dimension: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            format: CompressionFormat::Jpeg,
            quality_ladder: vec![85, 75, 65, 50, 35],
            try_alternate_format: true,
            large_file_threshold: 50 * 1024 * 1024,
            max_dimension: 4096,
        }
    }
}

/// Per-session delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_items_per_message: u8,
    pub byte_budget_per_message: u64,
    pub include_player_names: bool,
    pub send_overflow_player_messages: bool,
    pub compression: CompressionConfig,
    pub retry: RetryConfig,
    pub group_concurrency: usize,
    pub chunk_delay_ms: u64,
    pub forum_chunk_delay_ms: u64,
    pub group_delay_ms: u64,
    pub verify_destination: bool,
    pub session_retention_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_items_per_message: 10,
            byte_budget_per_message: 8 * 1024 * 1024,
            include_player_names: true,
            send_overflow_player_messages: true,
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
            group_concurrency: 1,
            chunk_delay_ms: 1000,
            forum_chunk_delay_ms: 2000,
            group_delay_ms: 500,
            verify_destination: true,
            session_retention_secs: 10 * 60,
        }
    }
}

impl DeliveryConfig {
    pub fn chunk_delay(&self, is_forum: bool) -> Duration {
        if is_forum {
            Duration::from_millis(self.forum_chunk_delay_ms)
        } else {
            Duration::from_millis(self.chunk_delay_ms)
        }
    }

    pub fn group_delay(&self) -> Duration {
        Duration::from_millis(self.group_delay_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}

/// Settings persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub last_destination_id: Option<i64>,
    pub group_by_world: bool,
    pub group_by_time: bool,
    pub time_window_minutes: u32,
    pub max_images_per_message: u8,
    pub byte_budget_mb: u64,
    pub include_player_names: bool,
    pub compression_format: CompressionFormat,
    pub quality_ladder: Vec<u8>,
    pub rate_limit_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub group_concurrency: usize,
    pub session_retention_minutes: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            last_destination_id: None,
            group_by_world: true,
            group_by_time: true,
            time_window_minutes: 10,
            max_images_per_message: 10,
            byte_budget_mb: 8,
            include_player_names: true,
            compression_format: CompressionFormat::Jpeg,
            quality_ladder: vec![85, 75, 65, 50, 35],
            rate_limit_delay_ms: 1000,
            max_retry_attempts: 3,
            group_concurrency: 1,
            session_retention_minutes: 10,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn grouping_config(&self) -> GroupingConfig {
        GroupingConfig {
            group_by_world: self.group_by_world,
            group_by_time: self.group_by_time,
            time_window_secs: u64::from(self.time_window_minutes) * 60,
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        let defaults = DeliveryConfig::default();
        DeliveryConfig {
            max_items_per_message: self.max_images_per_message,
            byte_budget_per_message: self.byte_budget_mb * 1024 * 1024,
            include_player_names: self.include_player_names,
            compression: CompressionConfig {
                format: self.compression_format,
                quality_ladder: self.quality_ladder.clone(),
                ..CompressionConfig::default()
            },
            retry: RetryConfig {
                max_attempts: self.max_retry_attempts.max(1),
                min_request_interval_ms: self.rate_limit_delay_ms,
                ..RetryConfig::default()
            },
            group_concurrency: self.group_concurrency,
            chunk_delay_ms: self.rate_limit_delay_ms,
            forum_chunk_delay_ms: self.rate_limit_delay_ms * 2,
            session_retention_secs: self.session_retention_minutes * 60,
            ..defaults
        }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

fn get_config_path() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join("VRChat Upload Engine");

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("config.json"))
}

pub fn load_config() -> AppResult<Config> {
    load_config_from(&get_config_path()?)
}

/// Load from an explicit path, writing defaults when the file does not exist
pub fn load_config_from(config_path: &Path) -> AppResult<Config> {
    if config_path.exists() {
        let config_str = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        validate_config(&config)?;
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config_to(config_path, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(config: &Config) -> AppResult<()> {
    validate_config(config)?;
    save_config_to(&get_config_path()?, config)
}

fn save_config_to(config_path: &Path, config: &Config) -> AppResult<()> {
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.max_images_per_message == 0 || config.max_images_per_message > 10 {
        return Err(AppError::validation(
            "max_images_per_message",
            "Must be between 1 and 10",
        ));
    }

    if config.byte_budget_mb == 0 {
        return Err(AppError::validation("byte_budget_mb", "Must be greater than 0"));
    }

    validate_quality_ladder(&config.quality_ladder)?;

    if config.rate_limit_delay_ms < 100 {
        return Err(AppError::validation(
            "rate_limit_delay_ms",
            "Must be at least 100ms",
        ));
    }

    if config.max_retry_attempts > 10 {
        return Err(AppError::validation(
            "max_retry_attempts",
            "Must be 10 or fewer",
        ));
    }

    if config.group_concurrency == 0 || config.group_concurrency > 4 {
        return Err(AppError::validation(
            "group_concurrency",
            "Must be between 1 and 4",
        ));
    }

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

pub fn validate_quality_ladder(ladder: &[u8]) -> AppResult<()> {
    if ladder.is_empty() {
        return Err(AppError::validation("quality_ladder", "Must not be empty"));
    }
    if ladder.iter().any(|&q| q == 0 || q > 100) {
        return Err(AppError::validation(
            "quality_ladder",
            "Quality must be between 1 and 100",
        ));
    }
    if ladder.windows(2).any(|pair| pair[0] <= pair[1]) {
        return Err(AppError::validation(
            "quality_ladder",
            "Quality levels must be strictly descending",
        ));
    }
    Ok(())
}

pub fn reset_config() -> AppResult<()> {
    let config_path = get_config_path()?;

    if config_path.exists() {
        let backup_path = config_path.with_extension("json.reset_backup");
        fs::copy(&config_path, &backup_path)?;
        log::info!("Existing config backed up to {}", backup_path.display());
    }

    save_config_to(&config_path, &Config::default())?;
    log::info!("Configuration reset to defaults");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_message_size() {
        let config = Config {
            max_images_per_message: 11,
            ..Config::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(AppError::Validation { field, .. }) if field == "max_images_per_message"
        ));
    }

    #[test]
    fn test_quality_ladder_must_descend() {
        assert!(validate_quality_ladder(&[85, 75, 50]).is_ok());
        assert!(validate_quality_ladder(&[75, 85]).is_err());
        assert!(validate_quality_ladder(&[85, 85]).is_err());
        assert!(validate_quality_ladder(&[]).is_err());
        assert!(validate_quality_ladder(&[0]).is_err());
    }

    #[test]
    fn test_delivery_config_derivation() {
        let config = Config {
            byte_budget_mb: 25,
            compression_format: CompressionFormat::Webp,
            rate_limit_delay_ms: 500,
            ..Config::default()
        };
        let delivery = config.delivery_config();
        assert_eq!(delivery.byte_budget_per_message, 25 * 1024 * 1024);
        assert_eq!(delivery.compression.format, CompressionFormat::Webp);
        assert_eq!(delivery.chunk_delay(false), Duration::from_millis(500));
        assert_eq!(delivery.chunk_delay(true), Duration::from_millis(1000));
        assert_eq!(config.grouping_config().time_window_secs, 600);
    }

    #[test]
    fn test_load_config_creates_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = load_config_from(&path).unwrap();
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let custom = Config {
            time_window_minutes: 30,
            compression_format: CompressionFormat::Webp,
            ..Config::default()
        };
        save_config_to(&path, &custom).unwrap();
        assert!(path.with_extension("json.bak").exists());
        assert_eq!(load_config_from(&path).unwrap(), custom);
    }

    #[test]
    fn test_compression_format_accepts_jpg_alias() {
        let format: CompressionFormat = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(format, CompressionFormat::Jpeg);
        assert_eq!(format.alternate(), CompressionFormat::Webp);
    }
}
