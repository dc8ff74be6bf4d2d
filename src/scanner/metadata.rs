use anyhow::Result;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use std::path::Path;

use crate::error::FinderError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
}

/// Decode `bytes` and read format and dimensions. Decoding doubles as the
/// validity check; anything that does not decode is an invalid image.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<(ImageMetadata, DynamicImage)> {
    let invalid = |reason: String| FinderError::InvalidImage {
        path: path.to_path_buf(),
        reason,
    };

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| invalid(e.to_string()))?;
    let format = reader.format().map(|f| format!("{:?}", f));
    let img = reader.decode().map_err(|e| invalid(e.to_string()))?;

    let metadata = ImageMetadata {
        width: Some(img.width()),
        height: Some(img.height()),
        format,
    };
    Ok((metadata, img))
}
