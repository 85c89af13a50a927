//! The operation surface consumed by front-ends. Every function returns an
//! [`ExecutionOutcome`] whose status maps onto the process exit code.

use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::kb::{KbError, KnowledgeBase};
use crate::core::tooling::outcome::ExecutionOutcome;

pub(crate) mod daemon;
pub(crate) mod doctor;
pub(crate) mod install;
pub(crate) mod interpreters;
pub(crate) mod run;
pub(crate) mod snapshots;
pub(crate) mod status;
pub(crate) mod uninstall;

pub use daemon::{daemon_start, daemon_status, daemon_stop};
pub use doctor::{doctor, prune, rebuild_kb};
pub use install::{install, install_with_driver, InstallOptions};
pub use interpreters::{
    adopt_interpreter, registry_path, remove_interpreter, rescan_interpreters, swap_interpreter,
};
pub use run::{run_script, run_script_with_driver, RunOptions};
pub use snapshots::{create_snapshot, list_snapshots, revert, revert_with_driver, RevertOptions};
pub use status::{list_packages, package_info, status};
pub use uninstall::{uninstall, UninstallOptions};

pub(crate) fn fail(ctx: &CommandContext, err: CoreError) -> ExecutionOutcome {
    err.into_outcome(ctx.catalog())
}

/// Versions of a package that exist as committed bubbles.
pub(crate) fn bubble_versions(kb: &KnowledgeBase, name: &str) -> Result<Vec<String>, KbError> {
    let prefix = format!("bubble:{name}:");
    let mut versions = Vec::new();
    for key in kb.scan(&prefix)? {
        if key.ends_with(":build") {
            continue;
        }
        if let Some(version) = key.strip_prefix(&prefix) {
            if !version.contains(':') {
                versions.push(version.to_string());
            }
        }
    }
    versions.sort();
    Ok(versions)
}
