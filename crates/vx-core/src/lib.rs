#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

mod core;

pub mod api;

pub use crate::core::bubble::{BubbleError, BubbleOutcome, BubbleRecord};
pub use crate::core::cancel::CancelToken;
pub use crate::core::config::context::CommandContext;
pub use crate::core::config::settings::{
    DaemonSettings, DedupPolicy, InterpreterSettings, KbBackendChoice,
};
pub use crate::core::daemon::{DaemonError, WorkerPool};
pub use crate::core::errors::CoreError;
pub use crate::core::installer::{InstallerDriver, InstallerError, Preflight, StagedResult};
pub use crate::core::interpreters::{InterpreterRecord, InterpreterRegistry};
pub use crate::core::kb::{KbError, KnowledgeBase};
pub use crate::core::loader::{ActivationGuard, LoaderError, LoaderRuntime, RuntimeState};
pub use crate::core::snapshot::{RevertAction, SnapshotStore};
pub use crate::core::tooling::outcome::{CommandStatus, ExecutionOutcome};

pub const VX_VERSION: &str = env!("CARGO_PKG_VERSION");
