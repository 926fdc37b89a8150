//! View state: everything the single screen displays
//!
//! Front ends render from this; only the controller mutates it.

use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::session::{AccelerationMode, SessionInfo};
use crate::vision::{ChipColor, ExecutionResult, TextDetection};

pub const NO_TEXT_FOUND: &str = "No text found";
pub const TEXT_FOUND: &str = "Text found";

/// A recognized word shown as a colored tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chip {
    pub text: String,
    pub color: ChipColor,
}

/// The picked input image
#[derive(Debug, Clone)]
pub struct Preview {
    pub image: Arc<RgbImage>,
    /// File the image was decoded from, if any
    pub source: Option<PathBuf>,
}

/// Engine status as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineStatus {
    /// Nothing built yet
    #[default]
    Absent,
    /// A rebuild is in progress
    Building(AccelerationMode),
    Ready(SessionInfo),
    /// Last construction failed; no engine installed
    Failed(String),
}

/// How the last run request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// No engine was installed
    Skipped,
    Cancelled,
    Failed,
}

/// Everything the screen shows
#[derive(Debug, Clone)]
pub struct ViewState {
    /// GPU/CPU toggle position
    pub use_gpu: bool,
    /// Whether the run control accepts clicks
    pub controls_enabled: bool,
    pub preview: Option<Preview>,
    pub result_image: Option<RgbImage>,
    pub log_text: String,
    pub result_text: String,
    pub chips: Vec<Chip>,
    /// Boxes drawn on the result image
    pub detections: Vec<TextDetection>,
    /// Caption above the chip list
    pub labels_found: &'static str,
    pub engine: EngineStatus,
    /// Mode the shown result was produced under
    pub result_mode: Option<AccelerationMode>,
    /// Run request awaiting a worker answer
    pub pending_run: Option<Uuid>,
    pub last_run: Option<(Uuid, RunStatus)>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            use_gpu: false,
            controls_enabled: true,
            preview: None,
            result_image: None,
            log_text: String::new(),
            result_text: String::new(),
            chips: Vec::new(),
            detections: Vec::new(),
            labels_found: NO_TEXT_FOUND,
            engine: EngineStatus::Absent,
            result_mode: None,
            pending_run: None,
            last_run: None,
        }
    }
}

impl ViewState {
    pub fn new(use_gpu: bool) -> Self {
        Self {
            use_gpu,
            ..Default::default()
        }
    }

    pub fn acceleration_mode(&self) -> AccelerationMode {
        AccelerationMode::from(self.use_gpu)
    }

    /// Replace the chip list and its caption
    pub fn set_chips<'a>(&mut self, items: impl IntoIterator<Item = (&'a String, &'a ChipColor)>) {
        self.chips = items
            .into_iter()
            .map(|(text, color)| Chip {
                text: text.clone(),
                color: *color,
            })
            .collect();

        self.labels_found = if self.chips.is_empty() {
            NO_TEXT_FOUND
        } else {
            TEXT_FOUND
        };
    }

    /// Show a finished run: result image, log, text and chips in one update
    pub fn apply_result(&mut self, result: &ExecutionResult) {
        self.result_image = Some(result.output_image().clone());
        self.log_text = result.execution_log().to_string();
        self.result_text = result.recognized_text().to_string();
        self.set_chips(result.items_found());
        self.detections = result.detections().to_vec();
        self.result_mode = Some(result.mode());
        self.controls_enabled = true;
    }

    /// Record the worker's answer to run `id` and re-enable controls
    pub fn finish_run(&mut self, id: Uuid, status: RunStatus) {
        self.pending_run = None;
        self.last_run = Some((id, status));
        self.controls_enabled = true;
    }
}
