use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::commands::ImageMetadata;
use crate::errors::{AppError, AppResult};
use crate::image_processor::{MetadataBlock, DESCRIPTION_KEYWORD, PNG_SIGNATURE};
use crate::security::InputValidator;

/// Write a copy of `file_path` as `<stem>_Modified.png` carrying `metadata`
/// in a `Description` text chunk. Any previous description is replaced.
pub async fn embed_metadata(file_path: &str, metadata: ImageMetadata) -> AppResult<String> {
    InputValidator::validate_image_file(file_path)?;

    let source = file_path.to_string();
    tokio::task::spawn_blocking(move || embed_metadata_blocking(&source, &metadata))
        .await
        .map_err(|e| AppError::Internal(format!("Metadata writer task failed: {}", e)))?
}

fn embed_metadata_blocking(file_path: &str, metadata: &ImageMetadata) -> AppResult<String> {
    let path = Path::new(file_path);
    let metadata_json = serde_json::to_string_pretty(&MetadataBlock::from(metadata))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let output_path = parent.join(format!("{}_Modified.png", stem));

    let img = image::open(path)?;
    let mut png_data = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)?;

    let modified = inject_png_metadata(&png_data, &metadata_json)?;
    fs::write(&output_path, modified)?;

    log::info!(
        "Embedded metadata in {} -> {}",
        file_path,
        output_path.display()
    );

    Ok(output_path.to_string_lossy().to_string())
}

fn inject_png_metadata(png_data: &[u8], metadata_json: &str) -> AppResult<Vec<u8>> {
    if png_data.len() < 8 || png_data[..8] != PNG_SIGNATURE {
        return Err(AppError::invalid_file_type("Not a valid PNG stream"));
    }

    let mut result = Vec::with_capacity(png_data.len() + metadata_json.len() + 32);
    result.extend_from_slice(&PNG_SIGNATURE);

    let mut pos = 8;
    let mut inserted = false;

    while pos + 8 <= png_data.len() {
        let length = u32::from_be_bytes([
            png_data[pos],
            png_data[pos + 1],
            png_data[pos + 2],
            png_data[pos + 3],
        ]) as usize;
        let chunk_type = &png_data[pos + 4..pos + 8];
        let chunk_end = pos + 12 + length;
        if chunk_end > png_data.len() {
            return Err(AppError::MetadataParsing("Truncated PNG chunk".to_string()));
        }

        if chunk_type == b"IDAT" && !inserted {
            write_text_chunk(&mut result, DESCRIPTION_KEYWORD, metadata_json)?;
            inserted = true;
        }

        let data = &png_data[pos + 8..pos + 8 + length];
        let is_description = matches!(chunk_type, b"tEXt" | b"iTXt" | b"zTXt")
            && data.starts_with(DESCRIPTION_KEYWORD.as_bytes())
            && data.get(DESCRIPTION_KEYWORD.len()) == Some(&0);

        if !is_description {
            result.extend_from_slice(&png_data[pos..chunk_end]);
        }

        pos = chunk_end;
    }

    if !inserted {
        return Err(AppError::MetadataParsing("PNG stream has no IDAT".to_string()));
    }

    Ok(result)
}

fn write_text_chunk(out: &mut Vec<u8>, keyword: &str, text: &str) -> AppResult<()> {
    if keyword.is_empty() || keyword.len() > 79 {
        return Err(AppError::validation("keyword", "Keyword must be 1-79 bytes"));
    }

    let mut data = Vec::with_capacity(keyword.len() + 1 + text.len());
    data.extend_from_slice(keyword.as_bytes());
    data.push(0);
    data.extend_from_slice(text.as_bytes());

    let mut crc = flate2::Crc::new();
    crc.update(b"tEXt");
    crc.update(&data);

    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(b"tEXt");
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{AuthorInfo, PlayerInfo, WorldInfo};
    use crate::image_processor::read_metadata;

    fn sample_metadata(world: &str) -> ImageMetadata {
        ImageMetadata {
            author: Some(AuthorInfo {
                display_name: "Photographer".to_string(),
                id: "usr_author".to_string(),
            }),
            world: Some(WorldInfo {
                name: world.to_string(),
                id: "wrld_123".to_string(),
                instance_id: "1~public".to_string(),
            }),
            players: vec![PlayerInfo {
                display_name: "Ünïcødé Friend".to_string(),
                id: "usr_friend".to_string(),
            }],
            timestamp: Some(1_700_000_000),
        }
    }

    fn write_png(path: &Path) {
        image::RgbImage::from_pixel(3, 3, image::Rgb([200, 100, 50]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_embed_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("shot.png");
        write_png(&source);

        let output = embed_metadata(source.to_str().unwrap(), sample_metadata("Plaza"))
            .await
            .unwrap();
        assert!(output.ends_with("shot_Modified.png"));

        let read = read_metadata(&output).unwrap().unwrap();
        assert_eq!(read, sample_metadata("Plaza"));
        assert_eq!(image::open(&output).unwrap().width(), 3);
    }

    #[tokio::test]
    async fn test_embedding_twice_replaces_description() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("again.png");
        write_png(&source);

        let first = embed_metadata(source.to_str().unwrap(), sample_metadata("First"))
            .await
            .unwrap();
        let second = embed_metadata(&first, sample_metadata("Second")).await.unwrap();

        let bytes = fs::read(&second).unwrap();
        let occurrences = bytes
            .windows(DESCRIPTION_KEYWORD.len() + 1)
            .filter(|w| w.starts_with(DESCRIPTION_KEYWORD.as_bytes()) && w[DESCRIPTION_KEYWORD.len()] == 0)
            .count();
        assert_eq!(occurrences, 1);
        assert_eq!(
            read_metadata(&second).unwrap().unwrap().world.unwrap().name,
            "Second"
        );
    }

    #[test]
    fn test_rejects_non_png_stream() {
        assert!(inject_png_metadata(b"not a png at all", "{}").is_err());
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let result = embed_metadata("/nonexistent/photo.png", sample_metadata("X")).await;
        assert!(result.is_err());
    }
}
