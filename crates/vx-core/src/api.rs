// Intended public API surface for `vx-core`.
//
// This module keeps the crate root small and makes explicit what a
// front-end (CLI, bridge, embedder) is expected to call.

pub use crate::core::bubble::{
    bubble_dir, BubbleBuilder, BubbleError, BubbleOutcome, BubbleRecord, DEPS_FILE, MANIFEST_FILE,
};
pub use crate::core::cancel::CancelToken;
pub use crate::core::config::context::CommandContext;
pub use crate::core::config::settings::{
    DaemonSettings, DedupPolicy, InterpreterSettings, KbBackendChoice, STATE_DIR_ENV,
};
pub use crate::core::daemon::{
    worker_spec_for_bubble, DaemonError, WorkerLauncher, WorkerPool, WorkerRequestBody,
    WorkerSpec, WorkerStatus, WORKER_BOOTSTRAP,
};
pub use crate::core::errors::CoreError;
pub use crate::core::flock::{InstallLock, LockError, LockHolder};
pub use crate::core::heal::{analyze as analyze_failure, HealRequirement, HealingPlan, PATTERNS};
pub use crate::core::health::{
    rebuild_kb as rebuild_kb_state, scan_bubbles, verify_bubble, verify_sample, BubbleScanReport,
    BubbleVerifyReport, RebuildReport,
};
pub use crate::core::installer::{
    version_reorder, InstallReport, InstallerDriver, InstallerError, InstallerTool, Preflight,
    StagedDelta, StagedResult,
};
pub use crate::core::interpreters::{
    InterpreterRecord, InterpreterRegistry, RescanReport, ENV_ACTIVE_BUBBLE, ENV_SUBPROCESS,
    ENV_TARGET_INTERPRETER,
};
pub use crate::core::kb::{keys as kb_keys, KbError, KnowledgeBase};
pub use crate::core::loader::{
    ActivationGuard, ActivationReport, LoaderError, LoaderRuntime, RuntimeState,
};
pub use crate::core::ops::{
    adopt_interpreter, create_snapshot, daemon_start, daemon_status, daemon_stop, doctor, install,
    install_with_driver, list_packages, list_snapshots, package_info, prune, rebuild_kb,
    registry_path, remove_interpreter, rescan_interpreters, revert, revert_with_driver,
    run_script, run_script_with_driver, status, swap_interpreter, uninstall, InstallOptions,
    RevertOptions, RunOptions, UninstallOptions,
};
pub use crate::core::snapshot::{plan_revert, RevertAction, SnapshotStore};
pub use crate::core::tooling::diagnostics::codes as diag_codes;
pub use crate::core::tooling::messages::Catalog;
pub use crate::core::tooling::outcome::{CommandStatus, ExecutionOutcome};
