//! Ferry daemon: orchestrator control loop, per-source sync tasks, and the
//! Unix socket server the CLI talks to.

mod error;
pub mod log_rotation;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod sink;
pub mod task;

pub use error::DaemonError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, PollReport};
pub use protocol::{
    request_snapshot, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
pub use sink::FileSink;
pub use task::{Carry, SyncTask, TaskContext};
