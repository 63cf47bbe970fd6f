use chrono::Offset;
use flate2::read::ZlibDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;

use crate::commands::{AuthorInfo, ImageMetadata, PlayerInfo, WorldInfo};
use crate::errors::{AppError, AppResult};
use crate::security::{FileSystemGuard, InputValidator};
use crate::uploader::image_groups::ImageRecord;

pub(crate) const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
pub(crate) const DESCRIPTION_KEYWORD: &str = "Description";
const XMP_KEYWORD: &str = "XML:com.adobe.xmp";

const MAX_TEXT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// On-disk shape of the metadata block, as written by VRCX-style tools
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetadataBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<BlockPerson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<BlockWorld>,
    #[serde(default)]
    pub players: Vec<BlockPerson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockPerson {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockWorld {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl From<MetadataBlock> for ImageMetadata {
    fn from(block: MetadataBlock) -> Self {
        let author = block.author.and_then(|a| match (a.display_name, a.id) {
            (Some(display_name), Some(id)) => Some(AuthorInfo { display_name, id }),
            _ => None,
        });

        let world = block.world.map(|w| WorldInfo {
            name: w.name.unwrap_or_else(|| "Unknown World".to_string()),
            id: w.id.unwrap_or_default(),
            instance_id: w.instance_id.unwrap_or_default(),
        });

        let players = block
            .players
            .into_iter()
            .filter_map(|p| match (p.display_name, p.id) {
                (Some(display_name), Some(id)) => Some(PlayerInfo { display_name, id }),
                _ => None,
            })
            .collect();

        ImageMetadata {
            author,
            world,
            players,
            timestamp: block.timestamp,
        }
    }
}

impl From<&ImageMetadata> for MetadataBlock {
    fn from(metadata: &ImageMetadata) -> Self {
        MetadataBlock {
            application: Some("VRChat Upload Engine".to_string()),
            version: Some(serde_json::Value::from(1)),
            author: metadata.author.as_ref().map(|a| BlockPerson {
                display_name: Some(a.display_name.clone()),
                id: Some(a.id.clone()),
            }),
            world: metadata.world.as_ref().map(|w| BlockWorld {
                name: Some(w.name.clone()),
                id: Some(w.id.clone()),
                instance_id: Some(w.instance_id.clone()),
            }),
            players: metadata
                .players
                .iter()
                .map(|p| BlockPerson {
                    display_name: Some(p.display_name.clone()),
                    id: Some(p.id.clone()),
                })
                .collect(),
            timestamp: metadata.timestamp,
        }
    }
}

/// Read the embedded metadata block of a file.
///
/// The VRCX-style `Description` JSON wins; VRChat's native XMP packet is the
/// fallback. Non-PNG files and PNGs carrying neither yield `None`.
/// A block that cannot be decoded or parsed also yields `None`, with a warning.
pub async fn extract_metadata(file_path: &str) -> AppResult<Option<ImageMetadata>> {
    let path = file_path.to_string();
    tokio::task::spawn_blocking(move || read_metadata(&path))
        .await
        .map_err(|e| AppError::Internal(format!("Metadata task failed: {}", e)))?
}

pub fn read_metadata(file_path: &str) -> AppResult<Option<ImageMetadata>> {
    if !Path::new(file_path).exists() {
        return Err(AppError::file_not_found(file_path));
    }

    let text = match read_png_text(file_path) {
        Ok(text) => text,
        Err(AppError::MetadataParsing(reason)) => {
            log::warn!("Ignoring malformed metadata in {}: {}", file_path, reason);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if let Some(description) = text.description {
        match parse_vrchat_metadata(description.trim()) {
            Ok(metadata) => {
                log::debug!(
                    "Parsed metadata for {} - Author: {}, World: {}, Players: {}",
                    file_path,
                    metadata.author.is_some(),
                    metadata.world.is_some(),
                    metadata.players.len()
                );
                return Ok(Some(metadata));
            }
            Err(e) => log::warn!("Failed to parse metadata JSON from {}: {}", file_path, e),
        }
    }

    // VRChat's own XMP packet carries author and world but no player list
    if let Some(metadata) = text.xmp.as_deref().and_then(parse_vrchat_xmp) {
        log::debug!(
            "Using VRChat XMP metadata for {} - Author: {}, World: {}",
            file_path,
            metadata.author.is_some(),
            metadata.world.is_some()
        );
        return Ok(Some(metadata));
    }

    log::debug!("No metadata block found in {}", file_path);
    Ok(None)
}

fn parse_vrchat_metadata(json: &str) -> AppResult<ImageMetadata> {
    let block: MetadataBlock = serde_json::from_str(json)
        .map_err(|e| AppError::MetadataParsing(e.to_string()))?;
    Ok(block.into())
}

/// Text chunks of interest found in one pass over a PNG
#[derive(Debug, Default)]
struct PngText {
    description: Option<String>,
    xmp: Option<String>,
}

/// Scan the PNG chunk stream for the `Description` and XMP text chunks.
///
/// Non-PNG input yields an empty result. Truncated streams and undecodable
/// `Description` payloads surface as `MetadataParsing`; a broken XMP chunk is
/// only logged.
fn read_png_text(file_path: &str) -> AppResult<PngText> {
    let file = fs::File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut found = PngText::default();

    let mut signature = [0u8; 8];
    if reader.read_exact(&mut signature).is_err() || signature != PNG_SIGNATURE {
        return Ok(found);
    }

    loop {
        let mut header = [0u8; 8];
        if reader.read_exact(&mut header).is_err() {
            return Err(AppError::MetadataParsing(
                "PNG stream ended before IEND".to_string(),
            ));
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let chunk_type = [header[4], header[5], header[6], header[7]];

        match &chunk_type {
            b"IEND" => return Ok(found),
            b"tEXt" | b"iTXt" | b"zTXt" if length <= MAX_TEXT_CHUNK_SIZE => {
                let mut data = vec![0u8; length];
                reader.read_exact(&mut data).map_err(|_| {
                    AppError::MetadataParsing("Truncated text chunk".to_string())
                })?;
                reader.seek(SeekFrom::Current(4))?;

                if found.description.is_none() {
                    found.description = read_text_chunk(&chunk_type, &data, DESCRIPTION_KEYWORD)?;
                }
                if found.xmp.is_none() {
                    found.xmp = read_text_chunk(&chunk_type, &data, XMP_KEYWORD)
                        .unwrap_or_else(|e| {
                            log::warn!("Skipping unreadable XMP chunk in {}: {}", file_path, e);
                            None
                        });
                }
            }
            _ => {
                reader.seek(SeekFrom::Current(length as i64 + 4))?;
            }
        }
    }
}

/// Decode a text chunk's body if its keyword matches
fn read_text_chunk(chunk_type: &[u8; 4], data: &[u8], keyword: &str) -> AppResult<Option<String>> {
    let Some(keyword_end) = data.iter().position(|&b| b == 0) else {
        return Ok(None);
    };
    if !data[..keyword_end].eq_ignore_ascii_case(keyword.as_bytes()) {
        return Ok(None);
    }
    let body = &data[keyword_end + 1..];

    match chunk_type {
        b"tEXt" => Ok(Some(decode_text(body))),
        b"zTXt" => {
            // compression method byte, then a zlib stream
            let compressed = body.get(1..).ok_or_else(|| {
                AppError::MetadataParsing("zTXt chunk missing compression method".to_string())
            })?;
            inflate(compressed).map(Some)
        }
        b"iTXt" => {
            let (flag, rest) = match body {
                [flag, _method, rest @ ..] => (*flag, rest),
                _ => {
                    return Err(AppError::MetadataParsing(
                        "iTXt chunk header truncated".to_string(),
                    ))
                }
            };
            // language tag and translated keyword are both null-terminated
            let text = skip_null_terminated(rest)
                .and_then(skip_null_terminated)
                .ok_or_else(|| {
                    AppError::MetadataParsing("iTXt chunk fields truncated".to_string())
                })?;

            if flag == 1 {
                inflate(text).map(Some)
            } else {
                String::from_utf8(text.to_vec())
                    .map(Some)
                    .map_err(|e| AppError::MetadataParsing(e.to_string()))
            }
        }
        _ => Ok(None),
    }
}

/// Author and world from a VRChat XMP packet (`xmp:Author`, `vrc:AuthorID`,
/// `vrc:WorldID`, `vrc:WorldDisplayName`), as elements or attributes.
fn parse_vrchat_xmp(xmp: &str) -> Option<ImageMetadata> {
    let author_name = extract_xmp_value(xmp, "Author");
    let author_id = extract_xmp_value(xmp, "AuthorID");
    let world_id = extract_xmp_value(xmp, "WorldID");
    let world_name = extract_xmp_value(xmp, "WorldDisplayName");

    let author = match (author_name, author_id) {
        (None, None) => None,
        (name, id) => Some(AuthorInfo {
            display_name: name.unwrap_or_default(),
            id: id.unwrap_or_default(),
        }),
    };
    let world = match (world_name, world_id) {
        (None, None) => None,
        (name, id) => Some(WorldInfo {
            name: name.unwrap_or_else(|| "Unknown World".to_string()),
            id: id.unwrap_or_default(),
            instance_id: String::new(),
        }),
    };

    if author.is_none() && world.is_none() {
        return None;
    }

    let timestamp = extract_xmp_value(xmp, "CreateDate")
        .and_then(|date| chrono::DateTime::parse_from_rfc3339(&date).ok())
        .map(|date| date.timestamp());

    Some(ImageMetadata {
        author,
        world,
        players: Vec::new(),
        timestamp,
    })
}

/// Value of an optionally namespaced XMP property, written either as
/// `<ns:Prop>value</ns:Prop>` or as `ns:Prop="value"`.
fn extract_xmp_value(xmp: &str, property: &str) -> Option<String> {
    let property = regex::escape(property);
    let patterns = [
        format!(r"<(?:\w+:)?{}(?:\s[^>]*)?>([^<]*)</(?:\w+:)?{}>", property, property),
        format!(r#"(?:^|[\s"'])(?:\w+:)?{}\s*=\s*"([^"]*)""#, property),
    ];

    patterns.iter().find_map(|pattern| {
        let re = Regex::new(pattern).ok()?;
        let value = unescape_xml(re.captures(xmp)?.get(1)?.as_str().trim());
        (!value.is_empty()).then_some(value)
    })
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn skip_null_terminated(data: &[u8]) -> Option<&[u8]> {
    let end = data.iter().position(|&b| b == 0)?;
    Some(&data[end + 1..])
}

/// UTF-8 first, Latin-1 as the fallback PNG tEXt actually specifies
fn decode_text(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    }
}

fn inflate(compressed: &[u8]) -> AppResult<String> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| AppError::MetadataParsing(format!("Bad deflate stream: {}", e)))?;
    String::from_utf8(decompressed).map_err(|e| AppError::MetadataParsing(e.to_string()))
}

fn filename_timestamp_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d{4}-\d{2}-\d{2})_(\d{2}-\d{2}-\d{2}(?:\.\d+)?)").ok())
        .as_ref()
}

/// Capture time from the VRChat file naming convention, read as local time.
///
/// Falls back to the file creation time when the name does not match.
pub fn get_timestamp_from_filename(file_path: &str) -> Option<i64> {
    let filename = Path::new(file_path).file_name().and_then(|n| n.to_str())?;

    if let Some(captures) = filename_timestamp_regex().and_then(|re| re.captures(filename)) {
        let date_part = captures.get(1)?.as_str();
        let time_part = captures.get(2)?.as_str().replace('-', ":");
        let datetime_str = format!("{} {}", date_part, time_part);

        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(&datetime_str, format) {
                let local_offset = chrono::Local::now().offset().fix();
                return match dt.and_local_timezone(local_offset).earliest() {
                    Some(local_dt) => Some(local_dt.timestamp()),
                    None => {
                        log::warn!(
                            "Could not resolve local time for {}, treating it as UTC",
                            filename
                        );
                        Some(dt.and_utc().timestamp())
                    }
                };
            }
        }
    }

    let created = fs::metadata(file_path).ok()?.created().ok()?;
    let timestamp = created
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    log::debug!("Using file creation time {} for {}", timestamp, file_path);
    Some(timestamp)
}

/// Dimensions and byte size, reading only the image header
pub fn get_image_info(file_path: &str) -> AppResult<(u32, u32, u64)> {
    InputValidator::validate_file_path(file_path)?;

    let file_size = FileSystemGuard::get_file_size(file_path)?;
    let (width, height) = image::ImageReader::open(file_path)?
        .with_guessed_format()?
        .into_dimensions()?;

    Ok((width, height, file_size))
}

/// Read everything the grouping and delivery stages need about one file
pub async fn load_image_record(file_path: &str) -> AppResult<ImageRecord> {
    let path = file_path.to_string();
    tokio::task::spawn_blocking(move || load_image_record_blocking(&path))
        .await
        .map_err(|e| AppError::Internal(format!("Image record task failed: {}", e)))?
}

fn load_image_record_blocking(file_path: &str) -> AppResult<ImageRecord> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(AppError::file_not_found(file_path));
    }

    let byte_size = FileSystemGuard::get_file_size(file_path)?;
    let dimensions = image::ImageReader::open(file_path)?
        .with_guessed_format()?
        .into_dimensions()
        .ok();
    if dimensions.is_none() {
        log::warn!("Could not read dimensions of {}", file_path);
    }

    let metadata = read_metadata(file_path)?;
    let timestamp = metadata
        .as_ref()
        .and_then(|m| m.timestamp)
        .or_else(|| get_timestamp_from_filename(file_path));

    Ok(ImageRecord {
        file_path: file_path.to_string(),
        byte_size,
        dimensions,
        metadata,
        timestamp,
    })
}
