//! Interpreter registry operations: adopt, remove, swap, rescan.

use std::path::{Path, PathBuf};

use serde_json::json;

use super::fail;
use crate::core::config::context::CommandContext;
use crate::core::config::settings::InterpreterSettings;
use crate::core::errors::CoreError;
use crate::core::interpreters::InterpreterRegistry;
use crate::core::tooling::outcome::ExecutionOutcome;

/// The registry is shared across interpreters, so it lives one level above
/// the per-interpreter state root.
pub fn registry_path(settings: &InterpreterSettings) -> PathBuf {
    settings
        .state_root
        .parent()
        .map(|parent| parent.join("interpreters.json"))
        .unwrap_or_else(|| settings.state_root.join("interpreters.json"))
}

pub fn adopt_interpreter(
    ctx: &CommandContext,
    executable: &Path,
    version: Option<&str>,
) -> ExecutionOutcome {
    let path = registry_path(ctx.settings());
    let result = InterpreterRegistry::load(&path).and_then(|mut registry| {
        let record = registry.adopt(executable, version, false)?;
        Ok(record)
    });
    match result {
        Ok(record) => ExecutionOutcome::success(
            "interpreter adopted",
            json!({
                "version": record.version,
                "executable": record.executable_path.display().to_string(),
                "registry_id": record.registry_id,
            }),
        ),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}

pub fn remove_interpreter(ctx: &CommandContext, version: &str) -> ExecutionOutcome {
    let path = registry_path(ctx.settings());
    let result = InterpreterRegistry::load(&path).and_then(|mut registry| registry.remove(version));
    match result {
        Ok(Some(record)) => ExecutionOutcome::success(
            "interpreter removed",
            json!({ "version": record.version }),
        ),
        Ok(None) => ExecutionOutcome::user_error(
            "interpreter is not registered",
            json!({ "version": version, "code": crate::core::tooling::diagnostics::codes::UNKNOWN_PACKAGE }),
        ),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}

/// Make `version` the default dispatch target.
pub fn swap_interpreter(ctx: &CommandContext, version: &str) -> ExecutionOutcome {
    let path = registry_path(ctx.settings());
    let result =
        InterpreterRegistry::load(&path).and_then(|mut registry| registry.set_default(version));
    match result {
        Ok(()) => ExecutionOutcome::success(
            "default interpreter swapped",
            json!({ "version": version }),
        ),
        Err(err) => ExecutionOutcome::user_error(
            "swap failed",
            json!({
                "version": version,
                "detail": err.to_string(),
                "code": crate::core::tooling::diagnostics::codes::UNKNOWN_PACKAGE,
            }),
        ),
    }
}

pub fn rescan_interpreters(ctx: &CommandContext, roots: &[PathBuf]) -> ExecutionOutcome {
    let path = registry_path(ctx.settings());
    let result = InterpreterRegistry::load(&path).and_then(|mut registry| registry.rescan(roots));
    match result {
        Ok(report) => ExecutionOutcome::success(
            "interpreter rescan complete",
            serde_json::to_value(&report).unwrap_or_default(),
        ),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}
