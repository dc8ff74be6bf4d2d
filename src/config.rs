use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::duplicates::MatchStrategy;
use crate::error::FinderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub duplicates: DuplicateConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("images-finder")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,

    /// Milliseconds a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_catalog_path() -> PathBuf {
    data_dir().join("catalog.db")
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Worker buffers awaiting merge. Defaults to `<path>.buffers`.
    #[serde(default)]
    pub buffer_dir: Option<PathBuf>,

    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_store_path() -> PathBuf {
    data_dir().join("embeddings.npy")
}

fn default_lock_timeout_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            buffer_dir: None,
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn buffer_dir(&self) -> PathBuf {
        self.buffer_dir.clone().unwrap_or_else(|| {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(".buffers");
            PathBuf::from(name)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,

    /// Below this many vectors the index is built as exact flat search.
    #[serde(default = "default_flat_threshold")]
    pub flat_threshold: usize,

    #[serde(default = "default_nlist")]
    pub nlist: usize,

    /// Number of product-quantizer sub-vectors; must divide the dimension.
    #[serde(default = "default_pq_m")]
    pub m: usize,

    #[serde(default = "default_nbits")]
    pub nbits: u32,

    #[serde(default = "default_nprobe")]
    pub nprobe: usize,

    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,

    #[serde(default = "default_train_points_per_list")]
    pub train_points_per_list: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_index_path() -> PathBuf {
    data_dir().join("index.bin")
}

fn default_flat_threshold() -> usize {
    100
}

fn default_nlist() -> usize {
    4096
}

fn default_pq_m() -> usize {
    64
}

fn default_nbits() -> u32 {
    8
}

fn default_nprobe() -> usize {
    32
}

fn default_kmeans_iterations() -> usize {
    20
}

fn default_train_points_per_list() -> usize {
    64
}

fn default_seed() -> u64 {
    42
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            flat_threshold: default_flat_threshold(),
            nlist: default_nlist(),
            m: default_pq_m(),
            nbits: default_nbits(),
            nprobe: default_nprobe(),
            kmeans_iterations: default_kmeans_iterations(),
            train_points_per_list: default_train_points_per_list(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Re-rank approximate candidates against the full-precision store.
    #[serde(default = "default_true")]
    pub hybrid: bool,

    #[serde(default = "default_k_approx")]
    pub k_approx: usize,

    #[serde(default = "default_k")]
    pub default_k: usize,

    #[serde(default = "default_true")]
    pub collapse_duplicates: bool,

    /// Permit a random projection for queries of the wrong dimension.
    /// Results are approximate at best.
    #[serde(default)]
    pub allow_lossy_projection: bool,
}

fn default_true() -> bool {
    true
}

fn default_k_approx() -> usize {
    1000
}

fn default_k() -> usize {
    20
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            hybrid: true,
            k_approx: default_k_approx(),
            default_k: default_k(),
            collapse_duplicates: true,
            allow_lossy_projection: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_true")]
    pub use_cache: bool,

    #[serde(default = "default_scan_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "webp".to_string(),
        "bmp".to_string(),
        "gif".to_string(),
    ]
}

fn default_scan_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("images-finder/scans")
}

fn default_cache_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            use_cache: true,
            cache_dir: default_scan_cache_dir(),
            cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_batch_size() -> usize {
    32
}

fn default_checkpoint_interval() -> usize {
    1000
}

fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cpus * 4) / 5).max(1)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_interval: default_checkpoint_interval(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    /// Maximum Hamming distance between perceptual hashes of duplicates.
    #[serde(default = "default_hash_threshold")]
    pub threshold: u32,

    #[serde(default)]
    pub strategy: MatchStrategy,
}

fn default_hash_threshold() -> u32 {
    5
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: default_hash_threshold(),
            strategy: MatchStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_embedding_dim() -> usize {
    512
}

fn default_models_dir() -> PathBuf {
    data_dir().join("models")
}

fn default_intra_threads() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: default_embedding_dim(),
            models_dir: default_models_dir(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_size")]
    pub size: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("images-finder/thumbnails")
}

fn default_thumb_size() -> u32 {
    384
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_thumb_cache_path(),
            size: default_thumb_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            store: StoreConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            scanner: ScannerConfig::default(),
            pipeline: PipelineConfig::default(),
            duplicates: DuplicateConfig::default(),
            model: ModelConfig::default(),
            thumbnails: ThumbnailConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = match std::env::var_os("IMAGES_FINDER_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::config_path(),
        };

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Default configuration with every artifact placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Config::default();
        config.catalog.path = root.join("catalog.db");
        config.store.path = root.join("embeddings.npy");
        config.index.path = root.join("index.bin");
        config.scanner.cache_dir = root.join("scan-cache");
        config.model.models_dir = root.join("models");
        config.thumbnails.path = root.join("thumbnails");
        config
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(FinderError::InvalidConfig(msg).into()) };

        if self.model.dim == 0 {
            return invalid("model.dim must be positive".to_string());
        }
        if self.index.m == 0 || self.model.dim % self.index.m != 0 {
            return invalid(format!(
                "index.m ({}) must divide model.dim ({})",
                self.index.m, self.model.dim
            ));
        }
        if self.index.nbits == 0 || self.index.nbits > 8 {
            return invalid(format!("index.nbits must be in 1..=8, got {}", self.index.nbits));
        }
        if self.index.nlist == 0 {
            return invalid("index.nlist must be at least 1".to_string());
        }
        if self.index.nprobe == 0 {
            return invalid("index.nprobe must be at least 1".to_string());
        }
        if self.index.flat_threshold == 0 {
            return invalid("index.flat_threshold must be at least 1".to_string());
        }
        if self.search.k_approx == 0 || self.search.default_k == 0 {
            return invalid(format!(
                "search.k_approx ({}) and search.default_k ({}) must be at least 1",
                self.search.k_approx, self.search.default_k
            ));
        }
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be at least 1".to_string());
        }
        if self.pipeline.batch_size == 0 {
            return invalid("pipeline.batch_size must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("images-finder")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [duplicates]
            threshold = 8
            strategy = "pairwise"

            [index]
            nprobe = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.duplicates.threshold, 8);
        assert_eq!(config.duplicates.strategy, MatchStrategy::Pairwise);
        assert_eq!(config.index.nprobe, 4);
        assert_eq!(config.index.nlist, 4096);
        assert_eq!(config.model.dim, 512);
        assert_eq!(config.search.k_approx, 1000);
        assert!(!config.search.allow_lossy_projection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_indivisible_pq() {
        let mut config = Config::default();
        config.index.m = 7;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let cases: [fn(&mut Config); 5] = [
            |c| c.index.nlist = 0,
            |c| c.index.nprobe = 0,
            |c| c.index.flat_threshold = 0,
            |c| c.search.k_approx = 0,
            |c| c.search.default_k = 0,
        ];
        for (i, zero) in cases.iter().enumerate() {
            let mut config = Config::default();
            zero(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err.downcast_ref::<FinderError>(), Some(FinderError::InvalidConfig(_))),
                "case {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_load_from_and_buffer_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::rooted_at(dir.path());
        config.pipeline.workers = 3;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.pipeline.workers, 3);
        assert_eq!(loaded.store.path, dir.path().join("embeddings.npy"));
        assert_eq!(
            loaded.store.buffer_dir(),
            dir.path().join("embeddings.npy.buffers")
        );
    }
}
