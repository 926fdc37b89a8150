//! State and messages shared between the controller, the worker and front ends

pub mod messages;
pub mod state;

pub use messages::{WorkerCommand, WorkerEvent};
pub use state::{EngineStatus, Preview, RunStatus, ViewState};
