//! Inference Worker
//!
//! A single dedicated background thread that executes engine rebuilds and
//! OCR runs in the order they were requested. Everything touching the
//! session manager happens here, keeping the controller thread responsive.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::{EngineFactory, RunOutcome, SessionManager};
use crate::shared::{WorkerCommand, WorkerEvent};

/// Handle to the running worker thread
pub struct InferenceWorker {
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    sessions: Arc<SessionManager>,
}

impl InferenceWorker {
    /// Spawn the worker. Returns the handle and the receiving end of its
    /// event channel.
    pub fn spawn(factory: Arc<dyn EngineFactory>) -> Result<(Self, Receiver<WorkerEvent>)> {
        let sessions = Arc::new(SessionManager::new(factory));
        let (commands, command_rx) = unbounded();
        let (event_tx, events) = unbounded();

        let thread_sessions = sessions.clone();
        let handle = std::thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || {
                info!("Inference worker starting...");
                worker_loop(&thread_sessions, &command_rx, &event_tx);
                thread_sessions.release();
                info!("Inference worker exiting...");
            })
            .context("Failed to spawn inference worker thread")?;

        Ok((
            Self {
                commands,
                handle: Some(handle),
                sessions,
            },
            events,
        ))
    }

    /// Queue a command; returns false if the worker has stopped
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Session manager shared with the worker thread
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Check if the worker thread is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the worker and wait for it to finish the command in progress
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Inference worker panicked during shutdown");
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    sessions: &SessionManager,
    commands: &Receiver<WorkerCommand>,
    events: &Sender<WorkerEvent>,
) {
    while let Ok(command) = commands.recv() {
        let event = match command {
            WorkerCommand::Shutdown => break,
            WorkerCommand::Rebuild(mode) => {
                let _ = events.send(WorkerEvent::EngineBuilding(mode));
                match catch_unwind(AssertUnwindSafe(|| sessions.rebuild(mode))) {
                    Ok(Ok(info)) => WorkerEvent::EngineReady(info),
                    Ok(Err(e)) => WorkerEvent::EngineFailed {
                        mode,
                        message: e.to_string(),
                    },
                    Err(panic) => WorkerEvent::EngineFailed {
                        mode,
                        message: format!(
                            "Engine construction panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    },
                }
            }
            WorkerCommand::Run { id, image, cancel } => {
                debug!("Processing run request {}", id);
                let run = || sessions.run_with_cancel(&image, &cancel);
                match catch_unwind(AssertUnwindSafe(run)) {
                    Ok(Ok(RunOutcome::Completed(result))) => WorkerEvent::RunCompleted {
                        id,
                        result: Box::new(result),
                    },
                    Ok(Ok(RunOutcome::Skipped)) => WorkerEvent::RunSkipped { id },
                    Ok(Ok(RunOutcome::Cancelled)) => WorkerEvent::RunCancelled { id },
                    Ok(Err(e)) => {
                        warn!("Run {} failed: {}", id, e);
                        WorkerEvent::RunFailed {
                            id,
                            message: e.to_string(),
                        }
                    }
                    Err(panic) => {
                        let message =
                            format!("OCR engine panicked: {}", panic_message(panic.as_ref()));
                        error!("Run {}: {}", id, message);
                        WorkerEvent::RunFailed { id, message }
                    }
                }
            }
        };

        if events.send(event).is_err() {
            debug!("Event receiver dropped; stopping inference worker");
            break;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeFactory;
    use crate::session::AccelerationMode;
    use image::RgbImage;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn run_command(id: Uuid) -> WorkerCommand {
        WorkerCommand::Run {
            id,
            image: Arc::new(RgbImage::new(8, 8)),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_commands_are_processed_in_order() {
        let (worker, events) = InferenceWorker::spawn(Arc::new(FakeFactory::default())).unwrap();

        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        assert!(worker.send(run_command(early)));
        assert!(worker.send(WorkerCommand::Rebuild(AccelerationMode::Cpu)));
        assert!(worker.send(run_command(late)));

        let first = events.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(first, WorkerEvent::RunSkipped { id } if id == early));
        assert!(matches!(
            events.recv_timeout(TIMEOUT).unwrap(),
            WorkerEvent::EngineBuilding(AccelerationMode::Cpu)
        ));
        assert!(matches!(events.recv_timeout(TIMEOUT).unwrap(), WorkerEvent::EngineReady(_)));
        match events.recv_timeout(TIMEOUT).unwrap() {
            WorkerEvent::RunCompleted { id, result } => {
                assert_eq!(id, late);
                assert_eq!(result.mode(), AccelerationMode::Cpu);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_engine_panic_is_contained() {
        let factory = FakeFactory {
            panic_runs: true,
            ..Default::default()
        };
        let (worker, events) = InferenceWorker::spawn(Arc::new(factory)).unwrap();
        worker.send(WorkerCommand::Rebuild(AccelerationMode::Cpu));
        let id = Uuid::new_v4();
        worker.send(run_command(id));

        let failed = events
            .iter()
            .find(|e| e.run_id() == Some(id))
            .unwrap();
        match failed {
            WorkerEvent::RunFailed { message, .. } => assert!(message.contains("engine exploded")),
            other => panic!("unexpected event {:?}", other),
        }

        // Worker keeps serving after the panic
        worker.send(WorkerCommand::Rebuild(AccelerationMode::Gpu));
        let settled = events.iter().find(|e| e.is_engine_settled()).unwrap();
        assert!(matches!(settled, WorkerEvent::EngineReady(_)));
        assert!(worker.is_running());
    }

    #[test]
    fn test_cancelled_before_execution() {
        let (worker, events) = InferenceWorker::spawn(Arc::new(FakeFactory::default())).unwrap();
        worker.send(WorkerCommand::Rebuild(AccelerationMode::Cpu));

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        cancel.cancel();
        worker.send(WorkerCommand::Run {
            id,
            image: Arc::new(RgbImage::new(4, 4)),
            cancel,
        });

        let event = events.iter().find(|e| e.run_id() == Some(id)).unwrap();
        assert!(matches!(event, WorkerEvent::RunCancelled { .. }));
    }

    #[test]
    fn test_shutdown_releases_engine() {
        let factory = Arc::new(FakeFactory::default());
        let (mut worker, events) = InferenceWorker::spawn(factory.clone()).unwrap();
        worker.send(WorkerCommand::Rebuild(AccelerationMode::Cpu));
        events.iter().find(|e| e.is_engine_settled()).unwrap();
        assert_eq!(factory.liveness.live(), 1);

        worker.shutdown();

        assert!(!worker.is_running());
        assert_eq!(factory.liveness.live(), 0);
        assert!(!worker.send(WorkerCommand::Rebuild(AccelerationMode::Cpu)));
    }
}
