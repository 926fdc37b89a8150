//! Model Session Manager
//!
//! Holds at most one live inference engine behind a single lock. Rebuilding
//! (on an acceleration-mode change) and running inference both take that lock,
//! so a mode switch can never interleave with an inference call on a
//! half-replaced engine.

use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::vision::ExecutionResult;

/// Where inference runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelerationMode {
    /// General-purpose compute
    #[default]
    Cpu,
    /// Hardware accelerator (CUDA / DirectML execution provider)
    Gpu,
}

impl From<bool> for AccelerationMode {
    fn from(accelerated: bool) -> Self {
        if accelerated {
            AccelerationMode::Gpu
        } else {
            AccelerationMode::Cpu
        }
    }
}

impl fmt::Display for AccelerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelerationMode::Cpu => write!(f, "CPU"),
            AccelerationMode::Gpu => write!(f, "GPU"),
        }
    }
}

/// A constructed engine able to run OCR over an image
pub trait InferenceEngine: Send {
    /// Run the model over `image`
    fn execute(&mut self, image: &RgbImage) -> anyhow::Result<ExecutionResult>;

    /// Mode this engine was built for
    fn mode(&self) -> AccelerationMode;
}

/// Builds engines; owns whatever context construction needs (model paths,
/// settings)
pub trait EngineFactory: Send + Sync {
    fn create(&self, mode: AccelerationMode) -> anyhow::Result<Box<dyn InferenceEngine>>;
}

/// Errors surfaced by the session manager
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to create {mode} OCR engine: {message}")]
    Construction { mode: AccelerationMode, message: String },

    #[error("OCR inference failed: {0}")]
    Inference(String),
}

/// Identity of the currently installed engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub mode: AccelerationMode,
    /// Incremented on every successful build
    pub generation: u64,
}

/// Outcome of a run request that did not fail
#[derive(Debug)]
pub enum RunOutcome {
    Completed(ExecutionResult),
    /// No engine was installed
    Skipped,
    /// The request was cancelled before it reached the engine
    Cancelled,
}

struct Session {
    engine: Box<dyn InferenceEngine>,
    info: SessionInfo,
}

struct Slot {
    session: Option<Session>,
    generation: u64,
}

/// Owns the single engine slot
pub struct SessionManager {
    factory: Arc<dyn EngineFactory>,
    slot: Mutex<Slot>,
}

impl SessionManager {
    /// Create a manager with no engine installed
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            slot: Mutex::new(Slot {
                session: None,
                generation: 0,
            }),
        }
    }

    /// Replace the engine with one built for `mode`.
    ///
    /// The previous engine is dropped before construction starts, so two
    /// engines are never alive at once. On failure the slot stays empty.
    pub fn rebuild(&self, mode: AccelerationMode) -> Result<SessionInfo, SessionError> {
        debug!("Rebuilding OCR engine for {}", mode);
        let mut slot = self.slot.lock();

        if let Some(old) = slot.session.take() {
            info!(
                "Releasing {} OCR engine (generation {})",
                old.info.mode, old.info.generation
            );
            drop(old);
        }

        match self.factory.create(mode) {
            Ok(engine) => {
                slot.generation += 1;
                let info = SessionInfo {
                    mode: engine.mode(),
                    generation: slot.generation,
                };
                slot.session = Some(Session { engine, info });
                info!("{} OCR engine ready (generation {})", mode, info.generation);
                Ok(info)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Failed to create {} OCR engine: {}", mode, message);
                Err(SessionError::Construction { mode, message })
            }
        }
    }

    /// Run the installed engine over `image`; skipped when none is installed
    pub fn run(&self, image: &RgbImage) -> Result<RunOutcome, SessionError> {
        self.run_with_cancel(image, &CancellationToken::new())
    }

    /// Like [`run`](Self::run), but returns `Cancelled` if `cancel` fired
    /// before the lock was acquired
    pub fn run_with_cancel(
        &self,
        image: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SessionError> {
        let mut slot = self.slot.lock();

        if cancel.is_cancelled() {
            debug!("Run cancelled before execution");
            return Ok(RunOutcome::Cancelled);
        }

        let Some(session) = slot.session.as_mut() else {
            warn!("Skipping OCR run since the engine has not been initialized");
            return Ok(RunOutcome::Skipped);
        };

        debug!(
            "Running {} OCR engine (generation {}) on {}x{} image",
            session.info.mode,
            session.info.generation,
            image.width(),
            image.height()
        );

        session
            .engine
            .execute(image)
            .map(RunOutcome::Completed)
            .map_err(|e| SessionError::Inference(format!("{:#}", e)))
    }

    /// Drop the installed engine, if any
    pub fn release(&self) {
        if let Some(old) = self.slot.lock().session.take() {
            info!("Released {} OCR engine", old.info.mode);
        }
    }

    /// Identity of the installed engine
    pub fn info(&self) -> Option<SessionInfo> {
        self.slot.lock().session.as_ref().map(|s| s.info)
    }
}
