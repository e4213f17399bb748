//! Icon file validation.
//!
//! The `icon` file is a data URL: `data:image/png;base64,` or
//! `data:image/jpeg;base64,` followed by the base64 image, at most 63 KiB in
//! total, and the payload must decode to a real image.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Upper bound on the whole icon file, prefix included.
pub const MAX_ICON_BYTES: usize = 63 * 1024;

const PREFIXES: [(&str, ImageFormat); 2] = [
    ("data:image/png;base64,", ImageFormat::Png),
    ("data:image/jpeg;base64,", ImageFormat::Jpeg),
];

#[derive(Debug, Error)]
pub enum IconError {
    #[error("failed to read icon file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid icon data prefix")]
    InvalidPrefix,

    #[error("icon is larger than size limit: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to decode base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to decode image data: {0}")]
    Image(#[from] image::ImageError),
}

/// Facts about a valid icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IconInfo {
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
    pub file_size: usize,
}

pub fn validate_icon(data: &[u8]) -> Result<IconInfo, IconError> {
    let (prefix, format) = PREFIXES
        .iter()
        .find(|(prefix, _)| data.starts_with(prefix.as_bytes()))
        .copied()
        .ok_or(IconError::InvalidPrefix)?;

    if data.len() > MAX_ICON_BYTES {
        return Err(IconError::TooLarge {
            size: data.len(),
            limit: MAX_ICON_BYTES,
        });
    }

    let payload = trim_ascii_end(&data[prefix.len()..]);
    let decoded = STANDARD.decode(payload)?;
    let image = image::load_from_memory(&decoded)?;

    Ok(IconInfo {
        mime: match format {
            ImageFormat::Jpeg => "image/jpeg",
            _ => "image/png",
        },
        width: image.width(),
        height: image.height(),
        file_size: data.len(),
    })
}

pub fn validate_icon_file(path: &Path) -> Result<IconInfo, IconError> {
    let data = std::fs::read(path).map_err(|source| IconError::Read {
        path: path.display().to_string(),
        source,
    })?;
    validate_icon(&data)
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}
