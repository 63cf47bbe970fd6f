//! Staged quality reduction so attachments fit a per-message byte budget.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use std::sync::Arc;

use crate::config::{CompressionConfig, CompressionFormat};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedImage {
    pub data: Vec<u8>,
    pub format: CompressionFormat,
    pub quality: u8,
}

impl CompressedImage {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    Unchanged(Arc<Vec<u8>>),
    Recoded(CompressedImage),
}

pub fn needs_compression(size: u64, budget: u64) -> bool {
    size > budget
}

/// Fit `original` into `budget` using the ladder of `format`.
///
/// Returns `Unchanged` when no recoding is needed and `FormatExhausted` when
/// even the lowest quality level is too large.
pub async fn compress_to_budget(
    file_path: &str,
    original: Arc<Vec<u8>>,
    budget: u64,
    format: CompressionFormat,
    config: &CompressionConfig,
) -> AppResult<CompressionOutcome> {
    if !needs_compression(original.len() as u64, budget) {
        return Ok(CompressionOutcome::Unchanged(original));
    }

    log::info!(
        "Compressing {} ({} bytes) into a {} byte budget as {}",
        file_path,
        original.len(),
        budget,
        format.as_str()
    );

    let ladder = config.quality_ladder.clone();
    let config = config.clone();
    run_blocking(move || {
        let image = decode(&original, &config)?;
        encode_first_fit(&image, format, &ladder, budget)
    })
    .await
    .map(CompressionOutcome::Recoded)
}

/// Continue the ladder strictly below `below_quality`.
///
/// Used when the endpoint still rejects an attachment as too large. The
/// result must be smaller than `current` as well as within `budget`.
pub async fn force_recompress(
    file_path: &str,
    original: Arc<Vec<u8>>,
    current_size: u64,
    below_quality: Option<u8>,
    budget: u64,
    format: CompressionFormat,
    config: &CompressionConfig,
) -> AppResult<CompressedImage> {
    let ladder: Vec<u8> = config
        .quality_ladder
        .iter()
        .copied()
        .filter(|&q| below_quality.map_or(true, |below| q < below))
        .collect();

    if ladder.is_empty() {
        return Err(AppError::FormatExhausted {
            format: format.as_str().to_string(),
        });
    }

    log::info!(
        "Forcing recompression of {} below quality {:?}",
        file_path,
        below_quality
    );

    let limit = budget.min(current_size.saturating_sub(1));
    let config = config.clone();
    run_blocking(move || {
        let image = decode(&original, &config)?;
        encode_first_fit(&image, format, &ladder, limit)
    })
    .await
}

/// Top-quality recoding in the preferred format, for endpoints that
/// rejected the original encoding
pub async fn reencode_for_compatibility(
    original: Arc<Vec<u8>>,
    config: &CompressionConfig,
) -> AppResult<CompressedImage> {
    let format = config.format;
    let quality = config.quality_ladder.first().copied().unwrap_or(85);
    let config = config.clone();
    run_blocking(move || {
        let image = decode(&original, &config)?;
        let data = encode(&image, format, quality)?;
        Ok(CompressedImage {
            data,
            format,
            quality,
        })
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("Compression task failed: {}", e)))?
}

fn decode(bytes: &[u8], config: &CompressionConfig) -> AppResult<DynamicImage> {
    let image = image::load_from_memory(bytes)?;

    if bytes.len() as u64 > config.large_file_threshold {
        let (width, height) = image.dimensions();
        if width > config.max_dimension || height > config.max_dimension {
            log::info!(
                "Downscaling large image from {}x{} to fit {}",
                width,
                height,
                config.max_dimension
            );
            return Ok(image.resize(
                config.max_dimension,
                config.max_dimension,
                image::imageops::FilterType::Lanczos3,
            ));
        }
    }

    Ok(image)
}

fn encode_first_fit(
    image: &DynamicImage,
    format: CompressionFormat,
    ladder: &[u8],
    budget: u64,
) -> AppResult<CompressedImage> {
    for &quality in ladder {
        let data = encode(image, format, quality)?;
        log::debug!(
            "{} quality {} produced {} bytes (budget {})",
            format.as_str(),
            quality,
            data.len(),
            budget
        );
        if data.len() as u64 <= budget {
            return Ok(CompressedImage {
                data,
                format,
                quality,
            });
        }
    }

    Err(AppError::FormatExhausted {
        format: format.as_str().to_string(),
    })
}

fn encode(image: &DynamicImage, format: CompressionFormat, quality: u8) -> AppResult<Vec<u8>> {
    match format {
        CompressionFormat::Jpeg => {
            let mut output = Vec::new();
            let encoder = JpegEncoder::new_with_quality(&mut output, quality);
            // JPEG carries no alpha channel
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
            Ok(output)
        }
        CompressionFormat::Webp => {
            let rgba = image.to_rgba8();
            let (width, height) = rgba.dimensions();
            let encoded = webp::Encoder::from_rgba(rgba.as_raw(), width, height)
                .encode(f32::from(quality));
            Ok(encoded.to_vec())
        }
    }
}
