//! Vision/OCR Layer
//!
//! Text detection and recognition over a picked image using PaddleOCR
//! models via ONNX Runtime, plus the result type handed back to the UI.

pub mod models;
pub mod ocr;
pub mod postprocess;
pub mod preprocess;
pub mod render;

use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::session::AccelerationMode;

pub use models::ModelManager;
pub use ocr::OnnxEngineFactory;

/// Display color for a recognized word (chip background and box outline)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChipColor(pub [u8; 3]);

impl ChipColor {
    pub fn to_rgb(self) -> image::Rgb<u8> {
        image::Rgb(self.0)
    }
}

impl fmt::Display for ChipColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
    }
}

/// Axis-aligned box in image coordinates (x, y, width, height)
pub type Bounds = (u32, u32, u32, u32);

/// One recognized text region
#[derive(Debug, Clone, Serialize)]
pub struct TextDetection {
    /// Recognized text content
    pub text: String,
    /// Bounding box (x, y, width, height)
    pub bounds: Bounds,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Color used to draw this region
    pub color: ChipColor,
}

/// Output of one successful inference run.
///
/// Built once by the engine and never mutated afterwards; the UI reads it
/// through the accessors.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    output_image: RgbImage,
    items_found: BTreeMap<String, ChipColor>,
    execution_log: String,
    recognized_text: String,
    detections: Vec<TextDetection>,
    mode: AccelerationMode,
}

impl ExecutionResult {
    /// Assemble a result from the detections drawn on `output_image`.
    ///
    /// Items and recognized text are derived from `detections`, which are
    /// expected in reading order.
    pub fn new(
        output_image: RgbImage,
        detections: Vec<TextDetection>,
        execution_log: String,
        mode: AccelerationMode,
    ) -> Self {
        let items_found = detections
            .iter()
            .filter(|d| !d.text.is_empty())
            .map(|d| (d.text.clone(), d.color))
            .collect();

        let recognized_text = detections
            .iter()
            .map(|d| d.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            output_image,
            items_found,
            execution_log,
            recognized_text,
            detections,
            mode,
        }
    }

    /// Input image with detection boxes drawn on it
    pub fn output_image(&self) -> &RgbImage {
        &self.output_image
    }

    /// Recognized words and their display colors
    pub fn items_found(&self) -> &BTreeMap<String, ChipColor> {
        &self.items_found
    }

    /// Free-text diagnostics for this run
    pub fn execution_log(&self) -> &str {
        &self.execution_log
    }

    /// All recognized strings in reading order
    pub fn recognized_text(&self) -> &str {
        &self.recognized_text
    }

    pub fn detections(&self) -> &[TextDetection] {
        &self.detections
    }

    /// Acceleration mode the engine ran under
    pub fn mode(&self) -> AccelerationMode {
        self.mode
    }
}
