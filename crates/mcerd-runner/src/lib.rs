pub mod cancel;
pub mod config;
pub mod convergence;
pub mod identity;
pub mod lifecycle;
pub mod observer;
pub mod optimize;
pub mod registry;
pub mod seed;
pub mod status;
pub mod worker;

use std::path::PathBuf;

pub use cancel::CancellationToken;
pub use config::{load_session_config, SessionConfig, TEMPLATE_CONFIG};
pub use convergence::{monitor_until_converged, ConvergenceCriteria, MonitorOutcome, MonitorReport};
pub use identity::RecoilElementIdentity;
pub use lifecycle::{
    ControllerSettings, Progress, SimulationController, SimulationState, StartReport,
    DEFAULT_BASE_SEED,
};
pub use observer::{
    ChannelObserver, Completion, ErrorReport, LoggingObserver, ProgressEvent, ProgressObserver,
    ProgressSubject, ProgressUpdate,
};
pub use optimize::{Evaluation, OptimizationLoop, OptimizationSummary};
pub use registry::{count_lines, ErdFileEntry, ErdFileRegistry};
pub use seed::{erd_file_name, parse_seed, validate_erd_file_names, ERD_EXTENSION};
pub use status::{write_run_status, RunStatus, RunStatusGuard};
pub use worker::{terminate_with_grace, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerRequest};

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("duplicate seed {seed}: {path} collides with an already registered file")]
    DuplicateSeed { seed: i64, path: PathBuf },

    #[error("cannot allocate {count} seeds above {after}")]
    SeedsExhausted { after: i64, count: usize },

    #[error("simulation is already running")]
    AlreadyRunning,

    #[error("worker for seed {seed} failed to start: {message}")]
    WorkerSpawnFailure { seed: i64, message: String },

    #[error("not an erd file name: {0}")]
    InvalidFileName(String),

    #[error("invalid recoil element identity '{0}'")]
    InvalidIdentity(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
