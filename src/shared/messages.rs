//! Message types for communication between the controller and the inference worker

use image::RgbImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::{AccelerationMode, SessionInfo};
use crate::vision::ExecutionResult;

/// Commands sent from the controller to the worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Release the current engine and build one for the given mode
    Rebuild(AccelerationMode),
    /// Run OCR over an image
    Run {
        id: Uuid,
        image: Arc<RgbImage>,
        cancel: CancellationToken,
    },
    /// Release the engine and stop the worker
    Shutdown,
}

/// Events sent from the worker back to the controller
#[derive(Debug)]
pub enum WorkerEvent {
    /// Engine construction started
    EngineBuilding(AccelerationMode),
    /// Engine constructed and installed
    EngineReady(SessionInfo),
    /// Engine construction failed; no engine is installed
    EngineFailed { mode: AccelerationMode, message: String },
    /// Inference finished
    RunCompleted { id: Uuid, result: Box<ExecutionResult> },
    /// No engine was installed when the run was reached
    RunSkipped { id: Uuid },
    /// The run was cancelled before it reached the engine
    RunCancelled { id: Uuid },
    /// Inference failed
    RunFailed { id: Uuid, message: String },
}

impl WorkerEvent {
    /// Id of the run request this event answers, if any
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            WorkerEvent::RunCompleted { id, .. }
            | WorkerEvent::RunSkipped { id }
            | WorkerEvent::RunCancelled { id }
            | WorkerEvent::RunFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Whether this event ends an engine rebuild
    pub fn is_engine_settled(&self) -> bool {
        matches!(self, WorkerEvent::EngineReady(_) | WorkerEvent::EngineFailed { .. })
    }
}
