//! Feature-extraction models mapping images and text into one embedding
//! space.
//!
//! Everything downstream only sees `EmbeddingModel`, so the CLIP runtime is
//! swappable and tests run against a deterministic stand-in.

mod model;

use anyhow::Result;

pub use model::ClipModel;

pub trait EmbeddingModel: Send + Sync {
    /// Length of every vector this model returns.
    fn dim(&self) -> usize;

    /// Unit-length embedding of an encoded image file.
    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>>;

    /// Unit-length embedding of a text query.
    fn encode_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Encode several images, keeping per-item failures separate.
    fn encode_images(&self, images: &[&[u8]]) -> Vec<Result<Vec<f32>>> {
        images.iter().map(|bytes| self.encode_image(bytes)).collect()
    }
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::HashModel;
    use super::*;

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);

        let mut zero = vec![0.0; 3];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }

    #[test]
    fn test_hash_model_is_deterministic() {
        let model = HashModel { dim: 16 };
        let a = model.encode_text("sunset over water").unwrap();
        assert_eq!(a, model.encode_text("sunset over water").unwrap());
        assert_ne!(a, model.encode_text("a cat").unwrap());
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let results = model.encode_images(&[b"not an image".as_slice()]);
        assert!(results[0].is_err());
    }
}
