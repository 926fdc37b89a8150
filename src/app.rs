//! Application Coordinator
//!
//! Headless controller for the single OCR screen. Event handlers (toggle,
//! pick image, run, cancel) dispatch work to the inference worker; the
//! results observer folds worker events back into the shared [`ViewState`].

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::RgbImage;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{AccelerationMode, EngineFactory, SessionInfo};
use crate::shared::{EngineStatus, Preview, RunStatus, ViewState, WorkerCommand, WorkerEvent};
use crate::worker::InferenceWorker;

/// Main application controller
pub struct OcrApp {
    state: Arc<RwLock<ViewState>>,
    worker: InferenceWorker,
    events: Receiver<WorkerEvent>,
    /// Cancellation handle of the pending run
    pending_cancel: Option<CancellationToken>,
    /// Rebuild requests the worker has not answered yet
    pending_rebuilds: usize,
}

impl OcrApp {
    /// Start the worker and request the initial engine build
    pub fn new(factory: Arc<dyn EngineFactory>, use_gpu: bool) -> Result<Self> {
        let (worker, events) = InferenceWorker::spawn(factory)?;
        let mut app = Self {
            state: Arc::new(RwLock::new(ViewState::new(use_gpu))),
            worker,
            events,
            pending_cancel: None,
            pending_rebuilds: 0,
        };

        app.request_rebuild(AccelerationMode::from(use_gpu));
        Ok(app)
    }

    /// Shared view state for front ends
    pub fn state(&self) -> Arc<RwLock<ViewState>> {
        self.state.clone()
    }

    /// Engine currently installed in the session slot.
    ///
    /// Waits for the worker's in-flight rebuild or run to finish.
    pub fn engine_info(&self) -> Option<SessionInfo> {
        self.worker.sessions().info()
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.is_running()
    }


    fn request_rebuild(&mut self, mode: AccelerationMode) {
        if self.worker.send(WorkerCommand::Rebuild(mode)) {
            self.pending_rebuilds += 1;
            self.state.write().engine = EngineStatus::Building(mode);
        } else {
            warn!("Inference worker is not running; cannot rebuild engine");
        }
    }

    /// GPU/CPU toggle handler: rebuild the engine for the new mode
    pub fn on_toggle_acceleration(&mut self, use_gpu: bool) {
        info!("Acceleration toggled: {}", AccelerationMode::from(use_gpu));
        self.state.write().use_gpu = use_gpu;
        self.request_rebuild(AccelerationMode::from(use_gpu));
    }

    /// Image picker handler: decode `path` and make it the preview.
    ///
    /// On decode failure the error is logged and returned; the previous
    /// preview stays in place.
    pub fn on_pick_image(&self, path: &Path) -> Result<()> {
        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                warn!("Failed to open image {:?}: {}", path, e);
                return Err(e).with_context(|| format!("Failed to open image {:?}", path));
            }
        };

        info!("Picked image {:?} ({}x{})", path, image.width(), image.height());
        self.set_preview(image, Some(path.to_path_buf()));
        Ok(())
    }

    /// Use an already-decoded image as the preview
    pub fn set_preview(&self, image: RgbImage, source: Option<PathBuf>) {
        self.state.write().preview = Some(Preview {
            image: Arc::new(image),
            source,
        });
    }

    /// Run button handler. Disables controls and queues OCR over the
    /// preview; returns the request id, or `None` when nothing was queued.
    pub fn on_run(&mut self) -> Option<Uuid> {
        let image = {
            let mut state = self.state.write();
            if !state.controls_enabled {
                debug!("Run ignored while another run is pending");
                return None;
            }
            let Some(preview) = state.preview.as_ref() else {
                info!("Skipping OCR run since no image has been picked");
                return None;
            };
            let image = preview.image.clone();
            state.controls_enabled = false;
            image
        };

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        if self.worker.send(WorkerCommand::Run {
            id,
            image,
            cancel: cancel.clone(),
        }) {
            self.state.write().pending_run = Some(id);
            self.pending_cancel = Some(cancel);
            debug!("Queued run {}", id);
            Some(id)
        } else {
            warn!("Inference worker is not running; run not queued");
            let mut state = self.state.write();
            state.log_text = "Inference worker is not running".to_string();
            state.controls_enabled = true;
            None
        }
    }

    /// Cancel the pending run if it has not reached the engine yet
    pub fn cancel_run(&mut self) -> bool {
        match self.pending_cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply all worker events received so far; returns how many
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(event);
            count += 1;
        }
        count
    }

    /// Block until the worker answers run `id`, applying events as they come
    pub fn wait_for_run(&mut self, id: Uuid, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let event = self
                .next_event(deadline)
                .with_context(|| format!("No answer for run {}", id))?;
            let answered = event.run_id() == Some(id);
            self.apply_event(event);
            if answered {
                return Ok(());
            }
        }
    }

    /// Block until every requested engine rebuild has finished
    pub fn wait_for_engine(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.pending_rebuilds > 0 {
            let event = self
                .next_event(deadline)
                .context("OCR engine rebuild did not finish")?;
            self.apply_event(event);
        }
        Ok(())
    }

    /// Block until pending rebuilds and the pending run are answered
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<()> {
        self.wait_for_engine(timeout)?;
        let pending = self.state.read().pending_run;
        match pending {
            Some(id) => self.wait_for_run(id, timeout),
            None => Ok(()),
        }
    }

    fn next_event(&self, deadline: Instant) -> Result<WorkerEvent> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.events.recv_timeout(remaining) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => anyhow::bail!("timed out"),
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("inference worker stopped"),
        }
    }

    /// Results observer: fold one worker event into the view state
    fn apply_event(&mut self, event: WorkerEvent) {
        let mut state = self.state.write();

        if event.is_engine_settled() {
            self.pending_rebuilds = self.pending_rebuilds.saturating_sub(1);
        }
        if let Some(id) = event.run_id() {
            if state.pending_run == Some(id) {
                self.pending_cancel = None;
            }
        }

        match event {
            WorkerEvent::EngineBuilding(mode) => {
                state.engine = EngineStatus::Building(mode);
            }
            WorkerEvent::EngineReady(info) => {
                state.engine = if self.pending_rebuilds > 0 {
                    EngineStatus::Building(state.acceleration_mode())
                } else {
                    EngineStatus::Ready(info)
                };
            }
            WorkerEvent::EngineFailed { mode, message } => {
                warn!("OCR engine unavailable ({}): {}", mode, message);
                state.log_text = message.clone();
                state.engine = if self.pending_rebuilds > 0 {
                    EngineStatus::Building(state.acceleration_mode())
                } else {
                    EngineStatus::Failed(message)
                };
            }
            WorkerEvent::RunCompleted { id, result } => {
                debug!("Run {} completed", id);
                state.apply_result(&result);
                state.finish_run(id, RunStatus::Completed);
            }
            WorkerEvent::RunSkipped { id } => {
                info!("Run {} skipped: OCR engine not initialized", id);
                state.finish_run(id, RunStatus::Skipped);
            }
            WorkerEvent::RunCancelled { id } => {
                info!("Run {} cancelled", id);
                state.finish_run(id, RunStatus::Cancelled);
            }
            WorkerEvent::RunFailed { id, message } => {
                warn!("Run {} failed: {}", id, message);
                state.log_text = message;
                state.finish_run(id, RunStatus::Failed);
            }
        }
    }
}
