pub mod cache;
pub mod discovery;
pub mod hashing;
pub mod metadata;
pub mod thumbnails;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::db::NewImage;

pub use cache::ScanCache;
pub use discovery::discover_images;
pub use hashing::{content_hash, PerceptualHash};
pub use metadata::ImageMetadata;
pub use thumbnails::{ThumbnailManager, Thumbnailer};

/// Everything the catalog needs to know about a file at registration.
#[derive(Debug, Clone)]
pub struct ImageAnalysis {
    pub path: PathBuf,
    pub file_size: u64,
    pub metadata: ImageMetadata,
    pub perceptual_hash: PerceptualHash,
    pub content_hash: String,
}

impl ImageAnalysis {
    pub fn to_new_image(&self) -> NewImage {
        NewImage {
            file_path: self.path.clone(),
            file_size: self.file_size,
            width: self.metadata.width,
            height: self.metadata.height,
            format: self.metadata.format.clone(),
            perceptual_hash: Some(self.perceptual_hash.to_hex()),
            content_hash: Some(self.content_hash.clone()),
        }
    }
}

/// Read, validate and fingerprint one file.
pub fn analyze_file(path: &Path) -> Result<ImageAnalysis> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let content_hash = content_hash(&bytes);
    let (metadata, img) = metadata::decode(path, &bytes)?;
    let perceptual_hash = PerceptualHash::of_image(&img)?;

    Ok(ImageAnalysis {
        path: path.to_path_buf(),
        file_size: bytes.len() as u64,
        metadata,
        perceptual_hash,
        content_hash,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    /// Write a small PNG whose pixels depend on `seed`.
    pub fn write_test_image(path: &Path, seed: u32) {
        let img = image::RgbImage::from_fn(48, 48, |x, y| {
            let a = (x * (seed % 5 + 1) + y * (seed % 3 + 2) + seed * 31) % 256;
            let b = ((x ^ y) + seed * 17) % 256;
            image::Rgb([a as u8, b as u8, ((a + b) / 2) as u8])
        });
        img.save(path).unwrap();
    }
}
