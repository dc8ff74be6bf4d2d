use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ThumbnailConfig;

/// Produces a display thumbnail for an image file.
pub trait Thumbnailer: Send + Sync {
    fn make_thumbnail(&self, path: &Path) -> Result<PathBuf>;
}

/// Manages thumbnail generation and caching
pub struct ThumbnailManager {
    cache_dir: PathBuf,
    size: u32,
}

impl ThumbnailManager {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            size: config.size,
        }
    }

    /// Cache filename derived from the md5 of the original path
    fn cache_path(&self, original: &Path) -> PathBuf {
        let digest = Md5::digest(original.to_string_lossy().as_bytes());
        self.cache_dir.join(format!("{:x}.jpg", digest))
    }

    /// Generate and cache a thumbnail for the given image
    /// Returns the path to the cached thumbnail
    pub fn generate(&self, original: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir)?;

        let cache_path = self.cache_path(original);

        // Skip if already cached
        if cache_path.exists() {
            return Ok(cache_path);
        }

        let img = image::open(original)
            .with_context(|| format!("Failed to open {}", original.display()))?;
        let thumbnail = img.thumbnail(self.size, self.size);

        // JPEG has no alpha channel
        image::DynamicImage::ImageRgb8(thumbnail.to_rgb8()).save(&cache_path)?;

        Ok(cache_path)
    }
}

impl Thumbnailer for ThumbnailManager {
    fn make_thumbnail(&self, path: &Path) -> Result<PathBuf> {
        self.generate(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_thumbnail() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("big.png");
        image::RgbaImage::from_pixel(200, 100, image::Rgba([10, 20, 30, 128]))
            .save(&source)
            .unwrap();

        let manager = ThumbnailManager::new(&ThumbnailConfig {
            enabled: true,
            path: dir.path().join("thumbs"),
            size: 50,
        });
        let thumb = manager.make_thumbnail(&source).unwrap();
        assert!(thumb.exists());
        assert_eq!(thumb.extension().unwrap(), "jpg");

        let img = image::open(&thumb).unwrap();
        assert_eq!(img.width(), 50);
        assert_eq!(img.height(), 25);

        // Second call hits the cache
        assert_eq!(manager.generate(&source).unwrap(), thumb);
    }
}
