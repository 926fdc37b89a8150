//! OCR (Optical Character Recognition) module
//!
//! Uses PaddleOCR models via ONNX Runtime for text detection and recognition.

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::Array2;
use std::fmt::Write as _;
use std::time::Instant;
use tracing::{debug, info};

use super::models::{load_dictionary, ModelManager, ModelPaths, OnnxSession};
use super::postprocess::{ctc_greedy_decode, extract_boxes, sort_reading_order};
use super::preprocess::{
    crop_bounds, preprocess_for_detection, preprocess_for_recognition, rgb_to_f32,
    PreprocessConfig,
};
use super::render::{color_for_word, draw_detections};
use super::{Bounds, ExecutionResult, TextDetection};
use crate::config::{AppConfig, OcrSettings};
use crate::session::{AccelerationMode, EngineFactory, InferenceEngine};

/// OCR engine: DB text detection followed by CTC text recognition
pub struct OcrModelExecutor {
    detector: OnnxSession,
    recognizer: OnnxSession,
    dictionary: Vec<String>,
    settings: OcrSettings,
    preprocess: PreprocessConfig,
    box_thickness: u32,
    mode: AccelerationMode,
}

impl OcrModelExecutor {
    /// Load both models for the given mode
    pub fn new(
        paths: &ModelPaths,
        mode: AccelerationMode,
        settings: &OcrSettings,
        intra_threads: usize,
        box_thickness: u32,
    ) -> Result<Self> {
        let detector = OnnxSession::new(&paths.detection, mode, intra_threads)
            .context("Failed to load text detection model")?;
        let recognizer = OnnxSession::new(&paths.recognition, mode, intra_threads)
            .context("Failed to load text recognition model")?;
        let dictionary = load_dictionary(&paths.dictionary)?;

        info!(
            "OCR engine initialized ({}, {} dictionary symbols)",
            mode,
            dictionary.len()
        );

        Ok(Self {
            detector,
            recognizer,
            dictionary,
            settings: settings.clone(),
            preprocess: PreprocessConfig::from(settings),
            box_thickness,
            mode,
        })
    }

    /// Find text regions; returns boxes in image coordinates, reading order
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Bounds>> {
        let (tensor, scale) = preprocess_for_detection(image, &self.preprocess);
        let (shape, data) = self.detector.run(tensor)?;

        // [N, 1, H, W] probability map
        let (map_h, map_w) = match shape.as_slice() {
            [.., h, w] => (*h, *w),
            _ => anyhow::bail!("Unexpected detection output shape {:?}", shape),
        };
        let plane = map_h * map_w;
        let prob_map =
            Array2::from_shape_vec((map_h, map_w), data.into_iter().take(plane).collect())
                .context("Detection output smaller than its shape")?;

        let (width, height) = image.dimensions();
        let mut boxes: Vec<Bounds> = extract_boxes(&prob_map, &self.settings.box_params())
            .iter()
            .map(|b| b.to_image_bounds(scale, width, height))
            .filter(|b| b.2 > 0 && b.3 > 0)
            .collect();

        sort_reading_order(&mut boxes);
        boxes.truncate(self.settings.max_text_regions);

        debug!("Detected {} text regions", boxes.len());
        Ok(boxes)
    }

    /// Recognize the text inside each box; low-confidence and empty results
    /// are dropped
    pub fn recognize(&mut self, image: &RgbImage, boxes: &[Bounds]) -> Result<Vec<TextDetection>> {
        let rgb = rgb_to_f32(image);
        let mut detections = Vec::with_capacity(boxes.len());

        for &bounds in boxes {
            let crop = crop_bounds(&rgb, bounds);
            let tensor = preprocess_for_recognition(&crop, &self.preprocess);
            let (shape, data) = self.recognizer.run(tensor)?;

            // [N, T, C]
            let (timesteps, vocab_size) = match shape.as_slice() {
                [_, t, c] => (*t, *c),
                _ => anyhow::bail!("Unexpected recognition output shape {:?}", shape),
            };

            let (text, confidence) =
                ctc_greedy_decode(&data, timesteps, vocab_size, &self.dictionary);
            if text.is_empty() || confidence < self.settings.rec_threshold {
                debug!("Dropping region {:?} ({:?}, {:.2})", bounds, text, confidence);
                continue;
            }

            detections.push(TextDetection {
                color: color_for_word(&text),
                text,
                bounds,
                confidence,
            });
        }

        Ok(detections)
    }
}

impl InferenceEngine for OcrModelExecutor {
    fn execute(&mut self, image: &RgbImage) -> Result<ExecutionResult> {
        let start = Instant::now();
        let boxes = self.detect(image)?;
        let detection_time = start.elapsed();

        let start = Instant::now();
        let detections = self.recognize(image, &boxes)?;
        let recognition_time = start.elapsed();

        let mut output_image = image.clone();
        draw_detections(&mut output_image, &detections, self.box_thickness);

        let mut log = String::new();
        let _ = writeln!(log, "Input image size: {}x{}", image.width(), image.height());
        let _ = writeln!(log, "Acceleration: {}", self.mode);
        let _ = writeln!(
            log,
            "Text detection execution time: {} ms",
            detection_time.as_millis()
        );
        let _ = writeln!(
            log,
            "Text recognition execution time: {} ms",
            recognition_time.as_millis()
        );
        let _ = writeln!(log, "Detected text regions: {}", boxes.len());
        let _ = write!(log, "Recognized text regions: {}", detections.len());

        info!(
            "OCR ({}) complete in {:?}: {} regions, {} recognized",
            self.mode,
            detection_time + recognition_time,
            boxes.len(),
            detections.len()
        );

        Ok(ExecutionResult::new(output_image, detections, log, self.mode))
    }

    fn mode(&self) -> AccelerationMode {
        self.mode
    }
}

/// Builds [`OcrModelExecutor`]s, downloading missing models on first use
pub struct OnnxEngineFactory {
    models: ModelManager,
    settings: OcrSettings,
    intra_threads: usize,
    box_thickness: u32,
}

impl OnnxEngineFactory {
    pub fn new(models: ModelManager, config: &AppConfig) -> Self {
        Self {
            models,
            settings: config.ocr.clone(),
            intra_threads: config.models.intra_threads,
            box_thickness: config.output.box_thickness,
        }
    }

    /// Factory using the configured (or default) models directory
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let models = match &config.models.models_dir {
            Some(dir) => ModelManager::with_dir(dir.clone())?,
            None => ModelManager::new()?,
        }
        .offline(config.models.offline);

        Ok(Self::new(models, config))
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn create(&self, mode: AccelerationMode) -> Result<Box<dyn InferenceEngine>> {
        let paths = self.models.ensure_all_models()?;
        let executor = OcrModelExecutor::new(
            &paths,
            mode,
            &self.settings,
            self.intra_threads,
            self.box_thickness,
        )?;
        Ok(Box::new(executor))
    }
}
