//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of PaddleOCR models.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::session::AccelerationMode;

/// Environment variable that forbids model downloads
pub const OFFLINE_ENV: &str = "TEXTSCOPE_OFFLINE";

/// Model identifier for PaddleOCR components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [
        ModelType::Detection,
        ModelType::Recognition,
        ModelType::Dictionary,
    ];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Download URL (PaddleOCR ONNX exports on Hugging Face)
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelType::Detection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelType::Recognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelType::Dictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
        }
    }

    /// Plausible file size range in bytes
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (2_000_000, 5_000_000),
            ModelType::Recognition => (7_000_000, 10_000_000),
            ModelType::Dictionary => (100, 10_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Unix seconds
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Availability of one model file
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub model_type: ModelType,
    pub available: bool,
    pub size_bytes: Option<u64>,
}

/// Paths to a complete model set
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detection: PathBuf,
    pub recognition: PathBuf,
    pub dictionary: PathBuf,
}

/// Downloads and caches ONNX models
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    offline: bool,
}

impl ModelManager {
    /// Model manager rooted at `<data dir>/models`
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            offline: false,
        })
    }

    /// Refuse downloads even when a model is missing
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Check if a model is present with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Check if all required models are available
    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&m| self.is_model_available(m))
    }

    /// Get status of all models
    pub fn get_model_status(&self) -> Vec<ModelStatus> {
        ModelType::ALL
            .iter()
            .map(|&model_type| ModelStatus {
                model_type,
                available: self.is_model_available(model_type),
                size_bytes: std::fs::metadata(self.model_path(model_type)).ok().map(|m| m.len()),
            })
            .collect()
    }

    /// Download a model if not already available.
    /// Returns the path to the model file
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        info!("Downloading model {:?}...", model_type);
        self.download_model(model_type)?;

        Ok(path)
    }

    /// Make sure the full model set is present
    pub fn ensure_all_models(&self) -> Result<ModelPaths> {
        Ok(ModelPaths {
            detection: self.ensure_model(ModelType::Detection)?,
            recognition: self.ensure_model(ModelType::Recognition)?,
            dictionary: self.ensure_model(ModelType::Dictionary)?,
        })
    }

    fn is_offline(&self) -> bool {
        self.offline || std::env::var_os(OFFLINE_ENV).is_some()
    }

    /// Download a specific model (blocking)
    pub fn download_model(&self, model_type: ModelType) -> Result<()> {
        let url = model_type.download_url();
        let path = self.model_path(model_type);

        if self.is_offline() {
            anyhow::bail!(
                "Offline mode: cannot download the {} model. \
                 Download it manually from {} and place it at {:?}",
                model_type.display_name(),
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);

        // Private runtime; callers are plain threads
        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let sha256 = rt.block_on(download_file(url, &path))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!("Download completed but model verification failed");
        }

        self.update_manifest_for_model(model_type, sha256)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    /// Record a downloaded model in the manifest
    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: unix_now(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `path` via a temp file; returns the hex SHA-256
async fn download_file(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);
    debug!("Downloaded {} bytes from {}", downloaded, url);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a recognition dictionary: one symbol per line
pub fn load_dictionary(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read character dictionary {:?}", path))?;
    let dictionary: Vec<String> = content
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect();

    if dictionary.is_empty() {
        anyhow::bail!("Character dictionary {:?} is empty", path);
    }
    Ok(dictionary)
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_name: String,
}

impl OnnxSession {
    /// Load a model for CPU or accelerated execution.
    ///
    /// In GPU mode the platform's accelerator execution provider is
    /// registered; ONNX Runtime falls back to CPU for unsupported nodes.
    pub fn new(model_path: &Path, mode: AccelerationMode, intra_threads: usize) -> Result<Self> {
        info!("Loading ONNX model ({}) from {:?}", mode, model_path);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?;

        let builder = match mode {
            AccelerationMode::Cpu => builder,
            AccelerationMode::Gpu => with_accelerator(builder)?,
        };

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("ONNX model has no inputs")?;

        let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        debug!("Model loaded. Input: {}, Outputs: {:?}", input_name, output_names);

        Ok(Self {
            session,
            input_name,
        })
    }

    /// Run the model on one NCHW f32 tensor and return the first output as
    /// (shape, data)
    pub fn run(&mut self, input: ndarray::Array4<f32>) -> Result<(Vec<usize>, Vec<f32>)> {
        let shape = input.shape().to_vec();
        let data = input.into_raw_vec_and_offset().0;
        let value = ort::value::Value::from_array((shape.as_slice(), data))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])
            .context("ONNX inference failed")?;
        let (out_shape, out_data) = outputs[0].try_extract_tensor::<f32>()?;

        let out_shape = out_shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((out_shape, out_data.to_vec()))
    }
}

/// Register the accelerator execution provider for this platform.
///
/// Registration failure is an error; there is no silent CPU fallback.
fn with_accelerator(builder: SessionBuilder) -> Result<SessionBuilder> {
    #[cfg(target_os = "windows")]
    let provider = {
        use ort::execution_providers::DirectMLExecutionProvider;
        info!("Requesting DirectML GPU acceleration");
        DirectMLExecutionProvider::default().build().error_on_failure()
    };

    #[cfg(not(target_os = "windows"))]
    let provider = {
        use ort::execution_providers::CUDAExecutionProvider;
        info!("Requesting CUDA GPU acceleration");
        CUDAExecutionProvider::default().build().error_on_failure()
    };

    builder.with_execution_providers([provider]).map_err(|e| {
        warn!("GPU execution provider unavailable: {}", e);
        anyhow::anyhow!("GPU execution provider unavailable: {}", e)
    })
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Detection.filename(), "det.onnx");
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_model_manager_with_dir() {
        let dir = tempdir().unwrap();
        let models_dir = dir.path().join("models");
        let manager = ModelManager::with_dir(models_dir.clone()).unwrap();

        assert!(models_dir.is_dir());
        assert_eq!(manager.model_path(ModelType::Detection), models_dir.join("det.onnx"));
        assert!(!manager.are_models_ready());
    }

    #[test]
    fn test_model_status_and_size_check() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();

        std::fs::write(manager.model_path(ModelType::Dictionary), "a\nb\nc\n".repeat(50)).unwrap();
        // Far too small to be a detection model
        std::fs::write(manager.model_path(ModelType::Detection), b"tiny").unwrap();

        let status = manager.get_model_status();
        assert_eq!(status.len(), 3);
        let dict = status.iter().find(|s| s.model_type == ModelType::Dictionary).unwrap();
        assert!(dict.available);
        let det = status.iter().find(|s| s.model_type == ModelType::Detection).unwrap();
        assert!(!det.available);
        assert_eq!(det.size_bytes, Some(4));
        let rec = status.iter().find(|s| s.model_type == ModelType::Recognition).unwrap();
        assert!(rec.size_bytes.is_none());
    }

    #[test]
    fn test_offline_refuses_download() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf())
            .unwrap()
            .offline(true);

        let err = manager.ensure_model(ModelType::Detection).unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(manager.load_manifest().unwrap().models.is_empty());

        let manifest = ModelManifest {
            version: "1.0.0".to_string(),
            models: vec![ModelInfo {
                model_type: "Detection".to_string(),
                filename: "det.onnx".to_string(),
                size_bytes: 42,
                sha256: Some("abc".to_string()),
                downloaded_at: 1,
            }],
        };
        manager.save_manifest(&manifest).unwrap();

        let loaded = manager.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].size_bytes, 42);
    }

    #[test]
    fn test_load_dictionary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "a\r\nb\n \n").unwrap();

        let dictionary = load_dictionary(&path).unwrap();
        assert_eq!(dictionary, vec!["a", "b", " "]);

        std::fs::write(&path, "").unwrap();
        assert!(load_dictionary(&path).is_err());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_missing_accelerator_fails_construction() {
        use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};

        if CUDAExecutionProvider::default().is_available().unwrap_or(false) {
            return;
        }

        let builder = Session::builder().unwrap();
        let err = match with_accelerator(builder) {
            Ok(_) => panic!("GPU session builder created without an accelerator"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("GPU execution provider unavailable"));
    }
}
