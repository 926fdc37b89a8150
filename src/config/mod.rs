//! Application Configuration
//!
//! User settings and preferences stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::vision::postprocess::BoxParams;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Model location and runtime settings
    pub models: ModelSettings,
    /// OCR pipeline settings
    pub ocr: OcrSettings,
    /// Result rendering settings
    pub output: OutputSettings,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Start with GPU acceleration enabled
    pub use_gpu: bool,
    /// Log filter used when RUST_LOG is not set
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            use_gpu: false,
            log_level: "info".to_string(),
        }
    }
}

/// Model location and ONNX Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Directory holding det.onnx / rec.onnx / dict.txt (defaults to the data dir)
    pub models_dir: Option<PathBuf>,
    /// Never download missing models
    pub offline: bool,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            offline: false,
            intra_threads: 4,
        }
    }
}

/// OCR pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Longest side of the detection input
    pub det_target_size: u32,
    /// Pixel threshold for the detection mask
    pub det_threshold: f32,
    /// Minimum mean score of a detected box
    pub box_threshold: f32,
    /// Box expansion ratio
    pub unclip_ratio: f32,
    /// Minimum box side in detection-map pixels
    pub min_box_size: u32,
    /// Recognition input height
    pub rec_target_height: u32,
    /// Recognition input max width
    pub rec_max_width: u32,
    /// Minimum recognition confidence (0.0 - 1.0)
    pub rec_threshold: f32,
    /// Maximum number of text regions recognized per image
    pub max_text_regions: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            det_target_size: 960,
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            min_box_size: 3,
            rec_target_height: 48,
            rec_max_width: 640,
            rec_threshold: 0.5,
            max_text_regions: 64,
        }
    }
}

impl OcrSettings {
    pub fn box_params(&self) -> BoxParams {
        BoxParams {
            det_threshold: self.det_threshold,
            box_threshold: self.box_threshold,
            unclip_ratio: self.unclip_ratio,
            min_box_size: self.min_box_size,
        }
    }
}

/// Result rendering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Outline width of drawn text boxes in pixels
    pub box_thickness: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self { box_thickness: 2 }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file {:?}", path))?;
    info!("Saved configuration to {:?}", path);
    Ok(())
}

/// `path` if given, else `<config dir>/config.toml`
pub fn config_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(crate::storage::get_config_dir()?.join("config.toml")),
    }
}

/// Load configuration from `path` or the default location, falling back to
/// defaults when no file exists
pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig> {
    let path = config_path(path)?;

    if path.exists() {
        let config = load_config(&path)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        info!("Using default configuration");
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!(!config.general.use_gpu);
        assert_eq!(config.general.log_level, "info");

        assert!(config.models.models_dir.is_none());
        assert!(!config.models.offline);
        assert_eq!(config.models.intra_threads, 4);

        assert_eq!(config.ocr.det_target_size, 960);
        assert!((config.ocr.det_threshold - 0.3).abs() < 0.01);
        assert!((config.ocr.box_threshold - 0.6).abs() < 0.01);
        assert_eq!(config.ocr.rec_target_height, 48);
        assert_eq!(config.ocr.max_text_regions, 64);

        assert_eq!(config.output.box_thickness, 2);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.general.use_gpu = true;
        config.models.models_dir = Some(PathBuf::from("/opt/models"));
        config.ocr.rec_threshold = 0.25;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert!(parsed.general.use_gpu);
        assert_eq!(parsed.models.models_dir, Some(PathBuf::from("/opt/models")));
        assert!((parsed.ocr.rec_threshold - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[general]\nuse_gpu = true\n").unwrap();

        assert!(parsed.general.use_gpu);
        assert_eq!(parsed.general.log_level, "info");
        assert_eq!(parsed.ocr.det_target_size, 960);
    }

    #[test]
    fn test_box_params_from_settings() {
        let settings = OcrSettings {
            det_threshold: 0.1,
            unclip_ratio: 2.0,
            ..Default::default()
        };
        let params = settings.box_params();
        assert!((params.det_threshold - 0.1).abs() < f32::EPSILON);
        assert!((params.unclip_ratio - 2.0).abs() < f32::EPSILON);
        assert_eq!(params.min_box_size, 3);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.general.use_gpu, loaded.general.use_gpu);
        assert_eq!(config.ocr.max_text_regions, loaded.ocr.max_text_regions);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(Some(&dir.path().join("missing.toml"))).unwrap();
        assert!(!config.general.use_gpu);
    }

    #[test]
    fn test_config_path_prefers_explicit() {
        let path = config_path(Some(Path::new("/tmp/textscope.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/textscope.toml"));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
