//! CLIP ViT-B/32 encoders on ONNX Runtime.

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use super::{normalize, EmbeddingModel};
use crate::config::ModelConfig;
use crate::error::FinderError;

const INPUT_SIZE: usize = 224;
const CONTEXT_LENGTH: usize = 77;
const START_TOKEN: i64 = 49406;
const END_TOKEN: i64 = 49407;

// CLIP normalization constants
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

struct ModelFile {
    filename: &'static str,
    url: &'static str,
}

const VISUAL: ModelFile = ModelFile {
    filename: "clip-vit-b32-vision.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
};

const TEXT: ModelFile = ModelFile {
    filename: "clip-vit-b32-text.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
};

/// Both encoders, each loaded on first use.
pub struct ClipModel {
    models_dir: PathBuf,
    intra_threads: usize,
    dim: usize,
    visual: OnceLock<Mutex<Session>>,
    text: OnceLock<Mutex<Session>>,
}

impl ClipModel {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            intra_threads: config.intra_threads,
            dim: config.dim,
            visual: OnceLock::new(),
            text: OnceLock::new(),
        }
    }

    /// Load the visual encoder now instead of on the first image.
    pub fn init(&self) -> Result<()> {
        self.session(&self.visual, &VISUAL).map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.visual.get().is_some()
    }

    fn session<'a>(&self, cell: &'a OnceLock<Mutex<Session>>, file: &ModelFile) -> Result<&'a Mutex<Session>> {
        if let Some(session) = cell.get() {
            return Ok(session);
        }

        let model_path = self.ensure_model(file)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(&model_path)
            .map_err(|e| FinderError::ModelUnavailable(format!("{}: {}", model_path.display(), e)))?;

        // A concurrent initializer may have won; either session is fine
        let _ = cell.set(Mutex::new(session));
        cell.get().ok_or_else(|| anyhow!("Model session not initialized"))
    }

    /// Download a model file if it doesn't exist
    fn ensure_model(&self, file: &ModelFile) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.models_dir)
            .with_context(|| format!("Failed to create {}", self.models_dir.display()))?;
        let model_path = self.models_dir.join(file.filename);
        if model_path.exists() {
            return Ok(model_path);
        }

        tracing::info!(model = %file.filename, "Downloading CLIP model...");
        let response = ureq::get(file.url)
            .call()
            .map_err(|e| FinderError::ModelUnavailable(format!("download of {} failed: {}", file.filename, e)))?;

        // Download beside the target so a partial file is never mistaken for a model
        let partial = model_path.with_extension("onnx.part");
        let mut out = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut out)?;
        out.sync_all()?;
        std::fs::rename(&partial, &model_path)?;

        tracing::info!(model = %file.filename, path = ?model_path, "CLIP model downloaded");
        Ok(model_path)
    }

    pub fn encode_image_file(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|e| FinderError::InvalidImage {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.encode_dynamic(&img)
    }

    fn encode_dynamic(&self, img: &DynamicImage) -> Result<Vec<f32>> {
        let input = pixel_values(img);
        let tensor = Tensor::from_array(([1usize, 3, INPUT_SIZE, INPUT_SIZE], input.into_boxed_slice()))?;

        let mut session = self
            .session(&self.visual, &VISUAL)?
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;
        let outputs = session.run(ort::inputs!["pixel_values" => tensor])?;
        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, data) = output.try_extract_tensor::<f32>()?;

        self.finish(data.to_vec())
    }

    fn finish(&self, mut embedding: Vec<f32>) -> Result<Vec<f32>> {
        if embedding.len() != self.dim {
            return Err(FinderError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            }
            .into());
        }
        normalize(&mut embedding);
        Ok(embedding)
    }
}

impl EmbeddingModel for ClipModel {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let img = image::load_from_memory(bytes)?;
        self.encode_dynamic(&img)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let tensor = Tensor::from_array(([1usize, CONTEXT_LENGTH], token_ids(text).into_boxed_slice()))?;

        let mut session = self
            .session(&self.text, &TEXT)?
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;
        let outputs = session.run(ort::inputs!["input_ids" => tensor])?;
        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, data) = output.try_extract_tensor::<f32>()?;

        self.finish(data.to_vec())
    }
}

/// 224x224 RGB, CLIP-normalized, NCHW.
fn pixel_values(img: &DynamicImage) -> Vec<f32> {
    let size = INPUT_SIZE as u32;
    let rgb = img
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let plane = INPUT_SIZE * INPUT_SIZE;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    data
}

/// Character-level ids framed by CLIP's start and end tokens, padded to the
/// context length. Not CLIP's BPE vocabulary.
fn token_ids(text: &str) -> Vec<i64> {
    let mut ids = Vec::with_capacity(CONTEXT_LENGTH);
    ids.push(START_TOKEN);
    ids.extend(
        text.to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .take(CONTEXT_LENGTH - 2)
            .map(|c| c as i64),
    );
    ids.push(END_TOKEN);
    ids.resize(CONTEXT_LENGTH, 0);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ids_framing() {
        let ids = token_ids("Red Car!");
        assert_eq!(ids.len(), CONTEXT_LENGTH);
        assert_eq!(ids[0], START_TOKEN);
        assert_eq!(ids[1], 'r' as i64);
        assert_eq!(ids[8], END_TOKEN);
        assert!(ids[9..].iter().all(|&id| id == 0));

        let long = token_ids(&"a".repeat(500));
        assert_eq!(long.len(), CONTEXT_LENGTH);
        assert_eq!(long[CONTEXT_LENGTH - 1], END_TOKEN);
    }

    #[test]
    fn test_pixel_values_layout() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(10, 10, image::Rgb([255, 0, 0])));
        let data = pixel_values(&img);
        assert_eq!(data.len(), 3 * INPUT_SIZE * INPUT_SIZE);
        let plane = INPUT_SIZE * INPUT_SIZE;
        assert!((data[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-5);
        assert!((data[plane] - (0.0 - MEAN[1]) / STD[1]).abs() < 1e-5);
    }

    #[test]
    fn test_new_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let model = ClipModel::new(&ModelConfig {
            models_dir: dir.path().join("models"),
            ..ModelConfig::default()
        });
        assert!(!model.is_ready());
        assert_eq!(model.dim(), 512);
    }
}
