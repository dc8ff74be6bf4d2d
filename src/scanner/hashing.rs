use anyhow::{anyhow, Result};
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::FinderError;

/// SHA-256 of the file bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// 64-bit perceptual fingerprint. Visually similar images have a small
/// Hamming distance between their hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub const BITS: u32 = 64;

    /// Compute the DCT mean hash of a decoded image.
    pub fn of_image(img: &DynamicImage) -> Result<Self> {
        use img_hash::{HashAlg, HasherConfig};

        // Hashing works on a 32x32 DCT input, so a small thumbnail is plenty
        let thumbnail = img.thumbnail(64, 64);

        let hasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();

        // Convert thumbnail to img_hash format
        let rgba = thumbnail.to_rgba8();
        let (width, height) = rgba.dimensions();

        let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
            .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

        let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));
        let bytes: [u8; 8] = hash
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow!("Unexpected perceptual hash length {}", hash.as_bytes().len()))?;

        Ok(Self(u64::from_be_bytes(bytes)))
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        let trimmed = hex.trim();
        if trimmed.is_empty() || trimmed.len() > 16 {
            return Err(FinderError::InvalidHash(hex.to_string()).into());
        }
        u64::from_str_radix(trimmed, 16)
            .map(Self)
            .map_err(|_| FinderError::InvalidHash(hex.to_string()).into())
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_and_distance() {
        let a = PerceptualHash::from_hex("00000000000000ff").unwrap();
        let b = PerceptualHash::from_hex("000000000000000f").unwrap();
        assert_eq!(a.distance(&b), 4);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.to_hex(), "00000000000000ff");
        assert_eq!(a.to_string(), a.to_hex());

        assert!(PerceptualHash::from_hex("not-hex").is_err());
        assert!(PerceptualHash::from_hex("").is_err());
        assert!(PerceptualHash::from_hex("0123456789abcdef0").is_err());
    }

    #[test]
    fn test_identical_images_hash_equal() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(96, 96, |x, y| {
            image::Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) % 256) as u8])
        }));
        let resized = img.resize_exact(48, 48, image::imageops::FilterType::Triangle);

        let h1 = PerceptualHash::of_image(&img).unwrap();
        let h2 = PerceptualHash::of_image(&img).unwrap();
        assert_eq!(h1, h2);
        // A downscaled copy stays close
        let h3 = PerceptualHash::of_image(&resized).unwrap();
        assert!(h1.distance(&h3) <= 10);
    }
}
